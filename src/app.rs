use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
};

use serde::{Deserialize, Serialize};

use crate::{
    capabilities::ModelService,
    catalog::{BackendJson, Catalog, CatalogError, Item, ItemId, ProcessingState, UniqueTag},
    categories::{self, CategorySync},
    config::Config,
    pipeline::{Orchestrator, PipelineError, PipelineReport},
    scan::{self, ScanError, ScanReport},
    search::{SearchEngine, SearchRequest, SearchResponse},
    storage::{BackendLocal, StorageManager},
    task_runner::{self, QueueDump, QueueStore, Task},
};

const THUMBNAILS_DIR: &str = "thumbnails";
const PROCESSED_DIR: &str = "processed";

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("photo {0} not found")]
    NotFound(ItemId),

    #[error("task queue is not running")]
    QueueStopped,

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stats {
    pub total_photos: usize,
    pub completed: usize,
    pub pending: usize,
    pub processing: usize,
    pub partial: usize,
    pub failed: usize,
    pub duplicate_links: usize,
    /// Share of completed photos, 0 to 100 with two decimals.
    pub completion_percentage: f64,
}

impl Stats {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a Item>, duplicate_links: usize) -> Self {
        let mut stats = Stats {
            duplicate_links,
            ..Default::default()
        };

        for item in items {
            stats.total_photos += 1;
            match item.state {
                ProcessingState::Completed => stats.completed += 1,
                ProcessingState::Pending => stats.pending += 1,
                ProcessingState::Partial => stats.partial += 1,
                ProcessingState::Failed => stats.failed += 1,
                _ => stats.processing += 1,
            }
        }

        if stats.total_photos > 0 {
            let pct = stats.completed as f64 / stats.total_photos as f64 * 100.0;
            stats.completion_percentage = (pct * 100.0).round() / 100.0;
        }

        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDetails {
    pub item: Item,
    pub tags: Vec<UniqueTag>,
    pub text: Option<String>,
    pub faces_count: usize,
    pub has_duplicates: bool,
    pub duplicates: Vec<ItemId>,
}

/// Wires the catalog, the models, the pipeline and the search engine
/// together, and owns the task queue thread.
pub struct App {
    config: Config,
    pub catalog: Arc<dyn Catalog>,
    pub models: Arc<ModelService>,
    pub orchestrator: Arc<Orchestrator>,
    pub search_engine: Arc<SearchEngine>,
    pub queue_store: QueueStore,

    task_tx: Option<mpsc::Sender<Task>>,
    task_queue_handle: Option<std::thread::JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl App {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let base_path = config.base_path().to_path_buf();

        let base_store: Arc<dyn StorageManager> = Arc::new(BackendLocal::new(&base_path)?);
        let catalog: Arc<dyn Catalog> = Arc::new(BackendJson::load(base_store.clone())?);
        let models = Arc::new(ModelService::new(config.models.clone(), base_path.clone()));

        let thumbnails = Arc::new(BackendLocal::new(base_path.join(THUMBNAILS_DIR))?);
        let processed = Arc::new(BackendLocal::new(base_path.join(PROCESSED_DIR))?);

        Ok(Self::new_with(
            config, catalog, models, base_store, thumbnails, processed,
        ))
    }

    pub fn new_with(
        config: Config,
        catalog: Arc<dyn Catalog>,
        models: Arc<ModelService>,
        queue_storage: Arc<dyn StorageManager>,
        thumbnails: Arc<dyn StorageManager>,
        processed: Arc<dyn StorageManager>,
    ) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(
            &config,
            catalog.clone(),
            models.clone(),
            thumbnails,
            processed,
        ));
        let search_engine = Arc::new(SearchEngine::new(
            catalog.clone(),
            models.clone(),
            config.search.clone(),
        ));

        Self {
            config,
            catalog,
            models,
            orchestrator,
            search_engine,
            queue_store: QueueStore::new(queue_storage),
            task_tx: None,
            task_queue_handle: None,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_server_addr(&mut self, addr: String) {
        self.config.server.addr = addr;
    }

    /// Starts the task queue and resubmits the tasks a previous run left
    /// unfinished.
    pub fn run_queue(&mut self) {
        let (task_tx, task_rx) = mpsc::channel::<Task>();

        for task in self.queue_store.take_unfinished() {
            log::info!("restarting interrupted task \"{task:?}\"");
            if let Err(err) = task_tx.send(task) {
                log::error!("failed to initialize interrupted task: {err:?}");
            }
        }

        let handle = std::thread::spawn({
            let orchestrator = self.orchestrator.clone();
            let queue_store = self.queue_store.clone();
            let queue_config = self.config.queue.clone();
            let stop = self.stop.clone();

            move || task_runner::start_queue(task_rx, orchestrator, queue_store, queue_config, stop)
        });

        self.task_queue_handle = Some(handle);
        self.task_tx = Some(task_tx);
    }

    /// Schedules a pipeline run for `id`.
    pub fn enqueue(&self, id: ItemId) -> Result<(), AppError> {
        if self.catalog.item(id)?.is_none() {
            return Err(AppError::NotFound(id));
        }

        let task_tx = self.task_tx.as_ref().ok_or(AppError::QueueStopped)?;
        task_tx
            .send(Task::Process { item_id: id })
            .map_err(|_| AppError::QueueStopped)
    }

    /// Runs the pipeline for `id` on the calling thread.
    pub fn process_now(&self, id: ItemId) -> Result<PipelineReport, AppError> {
        Ok(self.orchestrator.process(id)?)
    }

    pub fn task_queue(&self) -> QueueDump {
        self.queue_store.read()
    }

    /// Flag that makes the queue leave tasks that have not started yet for
    /// the next run.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Stops the queue after the running pipelines finish.
    pub fn interrupt(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.shutdown();
    }

    /// Stops the queue once every accepted task is done.
    pub fn shutdown(&self) {
        let Some(task_tx) = self.task_tx.as_ref() else {
            return;
        };
        if let Err(err) = task_tx.send(Task::Shutdown) {
            log::error!("{err}");
        }
    }

    pub fn wait_task_queue_finish(&mut self) {
        if let Some(handle) = self.task_queue_handle.take() {
            if let Err(err) = handle.join() {
                log::error!("task queue panicked: {err:?}");
            }
        }
    }

    /// Discovers photos under `dir` (or the configured library) and returns
    /// the ids that need processing.
    pub fn scan(&self, dir: Option<&Path>, progress: bool) -> Result<ScanReport, AppError> {
        let dir = match dir {
            Some(dir) => dir.to_path_buf(),
            None => self.config.library.photos_dir.clone().ok_or_else(|| {
                anyhow::anyhow!("no directory given and library.photos_dir is not set")
            })?,
        };

        Ok(scan::scan(
            self.catalog.as_ref(),
            &dir,
            &self.config.library.extensions,
            progress,
        )?)
    }

    pub fn search(&self, request: &SearchRequest) -> SearchResponse {
        self.search_engine.search(request)
    }

    pub fn stats(&self) -> Result<Stats, AppError> {
        let items = self.catalog.items()?;
        let links = self.catalog.links()?.len();
        Ok(Stats::from_items(&items, links))
    }

    pub fn details(&self, id: ItemId) -> Result<ItemDetails, AppError> {
        let item = self.catalog.item(id)?.ok_or(AppError::NotFound(id))?;

        let mut tags = self.catalog.unique_tags(id)?;
        tags.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let duplicates: Vec<ItemId> = self
            .catalog
            .links_for(id)?
            .iter()
            .map(|link| {
                if link.item_a == id {
                    link.item_b
                } else {
                    link.item_a
                }
            })
            .collect();

        Ok(ItemDetails {
            item,
            tags,
            text: self.catalog.text(id)?.map(|record| record.text),
            faces_count: self.catalog.faces(id)?.len(),
            has_duplicates: !duplicates.is_empty(),
            duplicates,
        })
    }

    /// Thumbnail bytes of `id`, `None` when it was never generated.
    pub fn thumbnail(&self, id: ItemId) -> Result<Option<Vec<u8>>, AppError> {
        let item = self.catalog.item(id)?.ok_or(AppError::NotFound(id))?;
        let Some(path) = item.thumbnail_path else {
            return Ok(None);
        };

        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn sync_categories(&self) -> Result<CategorySync, AppError> {
        Ok(categories::sync(
            self.catalog.as_ref(),
            &self.config.categories,
        )?)
    }

    /// Removes the digests that are not 64 hex chars and returns how many.
    pub fn purge_invalid_hashes(&self) -> Result<usize, AppError> {
        let purged = self.catalog.purge_invalid_hashes()?;
        for record in &purged {
            log::info!(
                "purged invalid hash of item {} ({} chars)",
                record.item_id,
                record.digest.len()
            );
        }
        Ok(purged.len())
    }
}

