//! Built-in label → category mappings and their idempotent sync into the
//! catalog.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, CatalogError, CategoryInsert};

pub const SEED: &[(&str, &[&str])] = &[
    (
        "electronics",
        &[
            "iPhone", "iPad", "MacBook", "laptop", "computer", "phone", "camera", "tablet",
            "headphones", "monitor", "keyboard", "mouse", "smartphone", "smartwatch", "earbuds",
            "speaker", "screen", "display", "device", "electronics", "gadget", "technology",
            "tech", "cell phone", "tv", "remote", "remote control",
        ],
    ),
    (
        "food",
        &[
            "pizza", "burger", "coffee", "cake", "pasta", "sushi", "salad", "beverage", "fruit",
            "bread", "dessert", "meal", "breakfast", "lunch", "dinner", "snack", "sandwich",
            "soup", "rice", "noodles", "tea", "juice", "food", "drink", "restaurant", "dish",
            "plate", "bowl", "banana", "apple", "orange", "broccoli", "carrot", "hot dog",
        ],
    ),
    (
        "landscape",
        &[
            "mountain", "beach", "sunset", "forest", "ocean", "sky", "nature", "park", "river",
            "lake", "tree", "cloud", "sunrise", "hill", "valley", "coast", "island", "waterfall",
            "desert", "field", "garden", "scenery", "outdoor", "landscape", "view",
        ],
    ),
    (
        "documents",
        &[
            "screenshot", "document", "receipt", "certificate", "text", "paper", "form",
            "invoice", "ticket", "card", "letter", "note", "page", "book", "magazine",
            "newspaper", "report", "contract", "presentation", "slide", "spreadsheet", "chart",
            "graph", "table",
        ],
    ),
    (
        "people",
        &[
            "person", "face", "portrait", "group", "crowd", "selfie", "family", "people", "man",
            "woman", "child", "baby", "friend", "couple", "team", "gathering", "party",
            "meeting", "wedding", "smile", "human", "individual",
        ],
    ),
    (
        "vehicles",
        &[
            "car", "bus", "truck", "train", "airplane", "boat", "bicycle", "motorcycle",
            "scooter", "van", "taxi", "transport", "vehicle", "traffic", "jeep", "pickup",
            "race car",
        ],
    ),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryConflict {
    pub label: String,
    pub wanted: String,
    pub existing: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategorySync {
    pub created: usize,
    pub unchanged: usize,
    pub conflicts: Vec<CategoryConflict>,
}

/// Seed mappings followed by the configured ones, which win over the seed
/// on first insert.
fn mappings(extra: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, (String, String)> = BTreeMap::new();

    for (category, labels) in SEED {
        for label in *labels {
            merged.insert(
                label.to_lowercase(),
                (label.to_string(), category.to_string()),
            );
        }
    }
    for (label, category) in extra {
        merged.insert(label.to_lowercase(), (label.clone(), category.clone()));
    }

    merged.into_values().collect()
}

/// Inserts missing mappings. Labels already mapped to another category are
/// reported, never reassigned.
pub fn sync(
    catalog: &dyn Catalog,
    extra: &BTreeMap<String, String>,
) -> Result<CategorySync, CatalogError> {
    let mut report = CategorySync::default();

    for (label, category) in mappings(extra) {
        match catalog.insert_category(&label, &category)? {
            CategoryInsert::Created => report.created += 1,
            CategoryInsert::Unchanged => report.unchanged += 1,
            CategoryInsert::Conflict { existing } => {
                log::warn!("'{label}' already maps to '{existing}', wanted '{category}'");
                report.conflicts.push(CategoryConflict {
                    label,
                    wanted: category,
                    existing,
                });
            }
        }
    }

    Ok(report)
}
