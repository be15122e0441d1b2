use std::time::Duration;

use crate::{
    catalog::{Catalog, ItemId, ProcessingState},
    config::Config,
    task_runner::Status,
};

use super::fakes::{detection, FakePhoto, TestLibrary};

fn library(max_workers: u16, max_retries: u8, soft_secs: u64, hard_secs: u64) -> TestLibrary {
    let mut config = Config::default();
    config.queue.max_workers = max_workers;
    config.queue.max_retries = max_retries;
    config.queue.retry_backoff_secs = 0;
    config.queue.soft_time_limit_secs = soft_secs;
    config.queue.hard_time_limit_secs = hard_secs;
    TestLibrary::with_config(config)
}

fn slow_photo(delay: Duration) -> FakePhoto {
    FakePhoto {
        detections: vec![detection("tortoise", 0.9, (0.0, 0.0, 40.0, 40.0))],
        delay: Some(delay),
        ..Default::default()
    }
}

fn run_to_completion(lib: &mut TestLibrary, ids: &[ItemId]) {
    lib.app.run_queue();
    for id in ids {
        lib.app.enqueue(*id).unwrap();
    }
    lib.app.shutdown();
    lib.app.wait_task_queue_finish();
}

#[test]
fn test_hard_limit_keeps_worker_limit_and_fails_items() {
    let mut lib = library(1, 0, 0, 1);
    let ids: Vec<ItemId> = (0..2)
        .map(|i| lib.add_photo(&format!("slow{i}.png"), slow_photo(Duration::from_secs(2))))
        .collect();

    run_to_completion(&mut lib, &ids);

    // an abandoned run keeps its slot until it stops
    assert_eq!(lib.fake.max_concurrent_detections(), 1);

    for id in &ids {
        let item = lib.catalog().item(*id).unwrap().unwrap();
        assert_eq!(item.state, ProcessingState::Failed);
        assert!(item.error_message.unwrap().contains("cancelled"));
    }

    let dump = lib.app.task_queue();
    assert_eq!(dump.queue.len(), 2);
    for task in &dump.queue {
        assert_eq!(task.status, Status::Error("timed out after 1s".to_string()));
    }
}

#[test]
fn test_timed_out_runs_are_retried_until_exhausted() {
    let mut lib = library(1, 1, 0, 1);
    let id = lib.add_photo("glacier.png", slow_photo(Duration::from_secs(2)));

    run_to_completion(&mut lib, &[id]);

    // the retry waited for the cancelled run to give its slot back
    assert_eq!(lib.fake.max_concurrent_detections(), 1);

    let dump = lib.app.task_queue();
    assert_eq!(dump.queue.len(), 1);
    assert_eq!(dump.queue[0].attempt, 1);
    assert_eq!(
        dump.queue[0].status,
        Status::Error("timed out after 1s".to_string())
    );
    assert_eq!(
        lib.catalog().item(id).unwrap().unwrap().state,
        ProcessingState::Failed
    );
}

#[test]
fn test_soft_limit_lets_the_run_finish() {
    let mut lib = library(1, 0, 0, 10);
    let id = lib.add_photo("snail.png", slow_photo(Duration::from_millis(500)));

    run_to_completion(&mut lib, &[id]);

    let dump = lib.app.task_queue();
    assert_eq!(
        dump.queue[0].status,
        Status::Done(ProcessingState::Completed)
    );
    assert_eq!(
        lib.catalog().item(id).unwrap().unwrap().state,
        ProcessingState::Completed
    );
}

#[test]
fn test_panicking_pipeline_is_not_retried() {
    let mut lib = library(1, 3, 600, 900);
    let id = lib.add_photo(
        "cursed.png",
        FakePhoto {
            panics: true,
            ..Default::default()
        },
    );

    run_to_completion(&mut lib, &[id]);

    let dump = lib.app.task_queue();
    assert_eq!(dump.queue[0].attempt, 0);
    assert_eq!(
        dump.queue[0].status,
        Status::Error("pipeline panicked".to_string())
    );

    let item = lib.catalog().item(id).unwrap().unwrap();
    assert_eq!(item.state, ProcessingState::Failed);
    assert_eq!(item.error_message.as_deref(), Some("pipeline panicked"));
}
