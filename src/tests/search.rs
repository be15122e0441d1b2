use chrono::{TimeZone, Utc};

use crate::{
    catalog::{Catalog, ItemId, ProcessingState},
    config::Config,
    search::{Mode, SearchRequest},
};

use super::fakes::{detection, FakePhoto, TestLibrary};

fn request(query: &str, mode: Mode) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        mode,
        ..Default::default()
    }
}

fn ids(lib: &TestLibrary, request: &SearchRequest) -> Vec<ItemId> {
    let response = lib.app.search(request);
    assert!(response.error.is_none(), "{:?}", response.error);
    response.results.iter().map(|hit| hit.item.id).collect()
}

/// cat photo with text, dog photo, menu photo, each with a distinct
/// embedding, all processed.
fn library() -> (TestLibrary, ItemId, ItemId, ItemId) {
    let lib = TestLibrary::new();
    lib.app.sync_categories().unwrap();

    let cat = lib.add_photo(
        "cat.png",
        FakePhoto {
            detections: vec![detection("cat", 0.9, (0.0, 0.0, 40.0, 40.0))],
            embedding: vec![1.0, 0.0, 0.0],
            text: Some("Adopt a cat today".to_string()),
            ..Default::default()
        },
    );
    let dog = lib.add_photo(
        "dog.png",
        FakePhoto {
            detections: vec![
                detection("dog", 0.8, (0.0, 0.0, 40.0, 40.0)),
                detection("car", 0.6, (0.0, 0.0, 40.0, 40.0)),
            ],
            embedding: vec![0.0, 1.0, 0.0],
            ..Default::default()
        },
    );
    let menu = lib.add_photo(
        "menu.png",
        FakePhoto {
            embedding: vec![0.7, 0.7, 0.0],
            text: Some("Pizza and coffee, cat cafe".to_string()),
            ..Default::default()
        },
    );

    for id in [cat, dog, menu] {
        lib.process(id);
    }

    lib.fake.set_query("cat", vec![1.0, 0.1, 0.0]);
    lib.fake.set_query("dog", vec![0.0, 1.0, 0.1]);

    (lib, cat, dog, menu)
}

#[test]
fn test_keyword_search_matches_text_and_labels() {
    let (lib, cat, dog, menu) = library();

    let found = ids(&lib, &request("cat", Mode::Keyword));
    // label confidence plus text rank beats text alone
    assert_eq!(found, vec![cat, menu]);

    assert_eq!(ids(&lib, &request("DOG", Mode::Keyword)), vec![dog]);
    assert!(ids(&lib, &request("giraffe", Mode::Keyword)).is_empty());
}

#[test]
fn test_semantic_search_orders_by_distance() {
    let (lib, cat, dog, menu) = library();

    let response = lib.app.search(&request("cat", Mode::Semantic));
    let found: Vec<ItemId> = response.results.iter().map(|hit| hit.item.id).collect();
    assert_eq!(found, vec![cat, menu, dog]);

    // scores are cosine distances, ascending
    assert!(response.results[0].score < response.results[1].score);
    assert!(response.results[1].score < response.results[2].score);
}

#[test]
fn test_hybrid_search_fuses_both_rankings() {
    let (lib, cat, dog, menu) = library();

    let response = lib.app.search(&request("cat", Mode::Hybrid));
    let found: Vec<ItemId> = response.results.iter().map(|hit| hit.item.id).collect();

    // cat is first in both lists, menu second in both, dog only semantic
    assert_eq!(found, vec![cat, menu, dog]);
    assert!((response.results[0].score - 2.0 / 61.0).abs() < 1e-6);
    assert!((response.results[2].score - 1.0 / 63.0).abs() < 1e-6);
    assert_eq!(response.total, 3);
    assert_eq!(response.mode, Mode::Hybrid);
}

#[test]
fn test_only_completed_items_are_searched() {
    let (lib, cat, _, menu) = library();

    let partial = lib.add_photo(
        "cat2.png",
        FakePhoto {
            detections: vec![detection("cat", 0.99, (0.0, 0.0, 40.0, 40.0))],
            ..Default::default()
        }
        .fail("text"),
    );
    let report = lib.process(partial);
    assert_eq!(report.state, ProcessingState::Partial);

    assert_eq!(ids(&lib, &request("cat", Mode::Keyword)), vec![cat, menu]);
}

#[test]
fn test_category_filter() {
    let (lib, _, dog, _) = library();

    let mut req = request("dog", Mode::Hybrid);
    req.categories = vec!["Vehicles".to_string()];
    assert_eq!(ids(&lib, &req), vec![dog]);

    // the dog label itself is not in the category, only the car is
    req.mode = Mode::Keyword;
    assert!(ids(&lib, &req).is_empty());

    req.categories = vec!["no-such-category".to_string()];
    req.mode = Mode::Hybrid;
    assert!(ids(&lib, &req).is_empty());
}

#[test]
fn test_date_filter() {
    let lib = TestLibrary::new();
    let old = lib.add_photo_at(
        "old.png",
        FakePhoto {
            detections: vec![detection("boat", 0.9, (0.0, 0.0, 40.0, 40.0))],
            ..Default::default()
        },
        Some(Utc.with_ymd_and_hms(2019, 6, 1, 12, 0, 0).unwrap()),
    );
    let new = lib.add_photo_at(
        "new.png",
        FakePhoto {
            detections: vec![detection("boat", 0.8, (0.0, 0.0, 40.0, 40.0))],
            ..Default::default()
        },
        Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
    );
    lib.process(old);
    lib.process(new);

    let mut req = request("boat", Mode::Keyword);
    assert_eq!(ids(&lib, &req), vec![old, new]);

    req.date_from = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(ids(&lib, &req), vec![new]);

    req.date_from = None;
    req.date_to = Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap());
    assert_eq!(ids(&lib, &req), vec![old]);
}

#[test]
fn test_pagination_reports_full_total() {
    let mut config = Config::default();
    config.search.page_size = 2;
    let lib = TestLibrary::with_config(config);

    let mut all = vec![];
    for i in 0..5 {
        let id = lib.add_photo(
            &format!("tree{i}.png"),
            FakePhoto {
                detections: vec![detection("tree", 0.9 - i as f32 * 0.1, (0.0, 0.0, 40.0, 40.0))],
                ..Default::default()
            },
        );
        lib.process(id);
        all.push(id);
    }

    let mut req = request("tree", Mode::Keyword);
    let first = lib.app.search(&req);
    assert_eq!(first.total, 5);
    assert_eq!(first.page, 1);
    assert_eq!(first.page_size, 2);
    assert_eq!(first.results.len(), 2);

    req.page = Some(3);
    let last = lib.app.search(&req);
    assert_eq!(last.results.len(), 1);
    assert_eq!(last.results[0].item.id, all[4]);

    req.page = Some(4);
    assert!(lib.app.search(&req).results.is_empty());

    // page size is clamped to the maximum
    req.page = Some(1);
    req.page_size = Some(10_000);
    let clamped = lib.app.search(&req);
    assert_eq!(clamped.page_size, 100);
    assert_eq!(clamped.results.len(), 5);
}

#[test]
fn test_result_metadata() {
    let lib = TestLibrary::new();
    let long_text = format!("poster {}", "x".repeat(300));
    let id = lib.add_photo(
        "poster.png",
        FakePhoto {
            detections: ["poster", "frame", "wall", "lamp", "chair", "plant", "rug"]
                .iter()
                .enumerate()
                .map(|(i, label)| detection(label, 0.9 - i as f32 * 0.1, (0.0, 0.0, 40.0, 40.0)))
                .collect(),
            text: Some(long_text),
            ..Default::default()
        },
    );
    lib.process(id);

    let response = lib.app.search(&request("poster", Mode::Keyword));
    let hit = &response.results[0];

    let labels: Vec<&str> = hit.matched_labels.iter().map(|l| l.label.as_str()).collect();
    assert_eq!(labels, vec!["poster", "frame", "wall", "lamp", "chair"]);

    let snippet = hit.snippet.as_ref().unwrap();
    assert!(snippet.ends_with("..."));
    assert_eq!(snippet.chars().count(), 203);
}

#[test]
fn test_search_errors_are_reported() {
    let (lib, ..) = library();

    let response = lib.app.search(&request("   ", Mode::Hybrid));
    assert!(response.results.is_empty());
    assert_eq!(response.total, 0);
    assert_eq!(response.error.as_deref(), Some("query is empty"));
}

#[test]
fn test_empty_library() {
    let lib = TestLibrary::new();
    for mode in [Mode::Hybrid, Mode::Keyword, Mode::Semantic] {
        let response = lib.app.search(&request("anything", mode));
        assert!(response.error.is_none());
        assert!(response.results.is_empty());
    }
    assert!(lib.catalog().items().unwrap().is_empty());
}

#[test]
fn test_hybrid_falls_back_to_keyword_when_embedder_fails() {
    let (lib, cat, _, menu) = library();
    lib.fake.break_text_embedder();

    let response = lib.app.search(&request("cat", Mode::Hybrid));
    let found: Vec<ItemId> = response.results.iter().map(|hit| hit.item.id).collect();
    assert_eq!(found, vec![cat, menu]);
    assert_eq!(response.total, 2);
    assert!((response.results[0].score - 1.0 / 61.0).abs() < 1e-6);
    assert!(response
        .error
        .as_deref()
        .is_some_and(|error| error.contains("clip down")));

    // semantic mode has nothing to fall back to
    let response = lib.app.search(&request("cat", Mode::Semantic));
    assert!(response.results.is_empty());
    assert!(response.error.is_some());

    // keyword mode does not need the embedder at all
    assert_eq!(ids(&lib, &request("cat", Mode::Keyword)), vec![cat, menu]);
}
