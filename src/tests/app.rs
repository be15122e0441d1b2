use crate::{
    app::{AppError, Stats},
    catalog::{Catalog, ProcessingState},
    config::Config,
    task_runner::Status,
};

use super::fakes::{detection, digest, FakePhoto, TestLibrary};

#[test]
fn test_stats_counts_states() {
    let lib = TestLibrary::new();
    assert_eq!(lib.app.stats().unwrap(), Stats::default());

    let done = lib.add_photo("done.png", FakePhoto::default());
    let partial = lib.add_photo("partial.png", FakePhoto::default().fail("faces"));
    lib.add_photo("waiting.png", FakePhoto::default());
    lib.process(done);
    lib.process(partial);

    let stats = lib.app.stats().unwrap();
    assert_eq!(stats.total_photos, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.partial, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.completion_percentage, 33.33);
}

#[test]
fn test_details() {
    let lib = TestLibrary::new();
    let first = lib.add_photo(
        "first.png",
        FakePhoto {
            detections: vec![
                detection("lamp", 0.4, (0.0, 0.0, 20.0, 20.0)),
                detection("sofa", 0.9, (0.0, 0.0, 20.0, 20.0)),
            ],
            text: Some("living room".to_string()),
            faces: 3,
            digest: digest('e', 0),
            ..Default::default()
        },
    );
    let second = lib.add_photo(
        "second.png",
        FakePhoto {
            digest: digest('e', 1),
            ..Default::default()
        },
    );
    lib.process(first);
    lib.process(second);

    let details = lib.app.details(first).unwrap();
    assert_eq!(details.item.id, first);
    assert_eq!(details.tags[0].label, "sofa");
    assert_eq!(details.text.as_deref(), Some("living room"));
    assert_eq!(details.faces_count, 3);
    assert!(details.has_duplicates);
    assert_eq!(details.duplicates, vec![second]);

    assert!(lib.app.thumbnail(first).unwrap().is_some_and(|data| !data.is_empty()));

    assert!(matches!(lib.app.details(999), Err(AppError::NotFound(999))));
}

#[test]
fn test_purge_invalid_hashes() {
    let lib = TestLibrary::new();
    let id = lib.add_photo(
        "hashed.png",
        FakePhoto {
            digest: digest('7', 0),
            ..Default::default()
        },
    );
    lib.process(id);

    assert_eq!(lib.app.purge_invalid_hashes().unwrap(), 0);
    assert!(lib.catalog().hash(id).unwrap().is_some());
}

#[test]
fn test_enqueue_requires_running_queue() {
    let lib = TestLibrary::new();
    let id = lib.add_photo("idle.png", FakePhoto::default());

    assert!(matches!(lib.app.enqueue(id), Err(AppError::QueueStopped)));
    assert!(matches!(lib.app.enqueue(77), Err(AppError::NotFound(77))));
}

#[test]
fn test_queue_processes_everything_before_shutdown() {
    let mut config = Config::default();
    config.queue.max_workers = 2;
    let mut lib = TestLibrary::with_config(config);

    let ids: Vec<_> = (0..5)
        .map(|i| {
            lib.add_photo(
                &format!("queued{i}.png"),
                FakePhoto {
                    detections: vec![detection("kite", 0.7, (0.0, 0.0, 20.0, 20.0))],
                    ..Default::default()
                },
            )
        })
        .collect();

    lib.app.run_queue();
    for id in &ids {
        lib.app.enqueue(*id).unwrap();
    }
    lib.app.shutdown();
    lib.app.wait_task_queue_finish();

    for id in &ids {
        let item = lib.catalog().item(*id).unwrap().unwrap();
        assert_eq!(item.state, ProcessingState::Completed);
    }

    let dump = lib.app.task_queue();
    assert_eq!(dump.queue.len(), 5);
    assert!(dump
        .queue
        .iter()
        .all(|task| task.status == Status::Done(ProcessingState::Completed)));
}

