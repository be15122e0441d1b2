use std::fmt::Display;

use crate::{
    capabilities::CapabilityError,
    catalog::{CatalogError, ItemId, ProcessingState},
    images::ImageError,
};

/// Enrichment stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preprocessing,
    DetectingObjects,
    Embedding,
    ExtractingText,
    DetectingFaces,
    Hashing,
    LinkingDuplicates,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Preprocessing,
        Stage::DetectingObjects,
        Stage::Embedding,
        Stage::ExtractingText,
        Stage::DetectingFaces,
        Stage::Hashing,
        Stage::LinkingDuplicates,
    ];

    /// State persisted on entry to the stage.
    pub fn state(&self) -> ProcessingState {
        match self {
            Stage::Preprocessing => ProcessingState::Preprocessing,
            Stage::DetectingObjects => ProcessingState::DetectingObjects,
            Stage::Embedding => ProcessingState::Embedding,
            Stage::ExtractingText => ProcessingState::ExtractingText,
            Stage::DetectingFaces => ProcessingState::DetectingFaces,
            Stage::Hashing => ProcessingState::Hashing,
            Stage::LinkingDuplicates => ProcessingState::LinkingDuplicates,
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.state().as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    Image(#[from] ImageError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageReport {
    Preprocessed { width: u32, height: u32 },
    Detected { kept: usize, dropped: usize, labels: usize },
    Embedded { dimensions: usize },
    TextExtracted { chars: usize },
    FacesDetected { count: usize },
    Hashed,
    Linked { compared: usize, created: usize },
}

#[derive(Debug)]
pub enum StageOutcome {
    Succeeded(StageReport),
    /// Nothing to do. Counts as neither success nor failure.
    Skipped(String),
    Failed(StageError),
}

impl StageOutcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, StageOutcome::Succeeded(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StageOutcome::Failed(_))
    }
}

#[derive(Debug)]
pub struct PipelineReport {
    pub item_id: ItemId,
    pub outcomes: Vec<(Stage, StageOutcome)>,
    pub state: ProcessingState,
}

impl PipelineReport {
    pub fn failed_stages(&self) -> Vec<Stage> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_failed())
            .map(|(stage, _)| *stage)
            .collect()
    }

    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.outcomes
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, outcome)| outcome)
    }

    /// `stage: error` for every failed stage, `None` if nothing failed.
    pub fn error_summary(&self) -> Option<String> {
        let errors: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|(stage, outcome)| match outcome {
                StageOutcome::Failed(e) => Some(format!("{stage}: {e}")),
                _ => None,
            })
            .collect();

        if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        }
    }
}

/// Aggregates stage outcomes into the item's final state.
pub fn terminal_state(outcomes: &[(Stage, StageOutcome)]) -> ProcessingState {
    let succeeded = outcomes.iter().filter(|(_, o)| o.is_succeeded()).count();
    let failed = outcomes.iter().filter(|(_, o)| o.is_failed()).count();

    if outcomes.is_empty() {
        ProcessingState::Failed
    } else if failed == 0 {
        ProcessingState::Completed
    } else if succeeded > 0 {
        ProcessingState::Partial
    } else {
        ProcessingState::Failed
    }
}
