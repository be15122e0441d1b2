use std::{
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        mpsc, Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rand::random;
use serde::{Deserialize, Serialize};

use crate::{
    catalog::{ItemId, ProcessingState},
    config::QueueConfig,
    pipeline::{Orchestrator, PipelineError},
    storage::StorageManager,
};

const QUEUE_DUMP_FILE: &str = "task-queue.json";

/// How long finished tasks stay visible in the dump.
const REMOVE_FINISHED_AFTER: Duration = Duration::from_secs(10);

pub fn now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Takes one of `max_workers` slots, waiting for a free one. Gives up and
/// returns `false` once `stop` is set.
pub fn throttle(running: &AtomicU16, max_workers: u16, stop: &AtomicBool) -> bool {
    loop {
        let current = running.load(Ordering::Acquire);
        if current < max_workers
            && running
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return true;
        }

        if stop.load(Ordering::Relaxed) {
            return false;
        }
        sleep(Duration::from_millis(100));
    }
}

/// A taken worker slot, given back when dropped.
struct Slot(Arc<AtomicU16>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Sleeps for `duration` unless `stop` is set meanwhile.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        sleep(Duration::from_millis(100).min(deadline.saturating_duration_since(Instant::now())));
    }
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Interrupted,
    Pending,
    InProgress,
    Done(ProcessingState),
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueDump {
    pub queue: Vec<TaskDump>,
    pub now: u128,
}

impl Default for QueueDump {
    fn default() -> Self {
        Self {
            queue: vec![],
            now: now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDump {
    pub id: String,
    pub task: Task,
    pub status: Status,
    #[serde(default)]
    pub attempt: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Task {
    /// run the enrichment pipeline for an item
    Process { item_id: ItemId },

    /// request to gracefully shutdown task queue
    Shutdown,
}

/// Persistent view of the queue, written to `task-queue.json` for
/// inspection and for resuming interrupted tasks on the next start.
#[derive(Clone)]
pub struct QueueStore {
    store: Arc<dyn StorageManager>,
    lock: Arc<Mutex<()>>,
}

impl QueueStore {
    pub fn new(store: Arc<dyn StorageManager>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn read(&self) -> QueueDump {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> QueueDump {
        if !self.store.exists(QUEUE_DUMP_FILE) {
            return QueueDump::default();
        }

        match self.store.read(QUEUE_DUMP_FILE) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                log::error!("queue dump is malformed, starting empty: {e}");
                QueueDump::default()
            }),
            Err(e) => {
                log::error!("failed to read queue dump: {e}");
                QueueDump::default()
            }
        }
    }

    fn write_unlocked(&self, queue_dump: &mut QueueDump) {
        queue_dump.now = now();

        let data = match serde_json::to_vec_pretty(&queue_dump) {
            Ok(data) => data,
            Err(e) => {
                log::error!("failed to serialize queue dump: {e}");
                return;
            }
        };
        if let Err(e) = self.store.write(QUEUE_DUMP_FILE, &data) {
            log::error!("failed to write queue dump: {e}");
        }
    }

    fn modify(&self, f: impl FnOnce(&mut QueueDump)) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut queue_dump = self.read_unlocked();
        f(&mut queue_dump);
        self.write_unlocked(&mut queue_dump);
    }

    /// Empties the dump and returns the tasks that were cut short. Tasks
    /// that gave up stay given up.
    pub fn take_unfinished(&self) -> Vec<Task> {
        let mut unfinished = vec![];
        self.modify(|queue_dump| {
            unfinished = std::mem::take(&mut queue_dump.queue)
                .into_iter()
                .filter(|td| !matches!(td.status, Status::Done(_) | Status::Error(_)))
                .map(|td| td.task)
                .collect();
        });
        unfinished
    }

    pub fn save_task(&self, task: Task, status: Status) -> String {
        let id = rusty_ulid::generate_ulid_string();

        self.modify(|queue_dump| {
            queue_dump.queue.push(TaskDump {
                id: id.clone(),
                task,
                status,
                attempt: 0,
            })
        });

        id
    }

    pub fn set_status(&self, id: &str, status: Status) {
        self.modify(|queue_dump| {
            if let Some(task_dump) = queue_dump.queue.iter_mut().find(|td| td.id == id) {
                task_dump.status = status;
            }
        });
    }

    fn set_attempt(&self, id: &str, attempt: u8) {
        self.modify(|queue_dump| {
            if let Some(task_dump) = queue_dump.queue.iter_mut().find(|td| td.id == id) {
                task_dump.attempt = attempt;
            }
        });
    }

    pub fn remove_task(&self, id: &str) {
        self.modify(|queue_dump| queue_dump.queue.retain(|td| td.id != id));
    }
}

fn rand_jitter() -> u64 {
    random::<u64>() % 2000
}

/// Delay before retry number `attempt` (1-based).
pub fn backoff(config: &QueueConfig, attempt: u8) -> Duration {
    let base_ms = config.retry_backoff_secs * 1000;
    Duration::from_millis(base_ms * 2u64.pow(attempt.saturating_sub(1) as u32) + rand_jitter())
}

enum RunError {
    Pipeline(PipelineError),
    TimedOut(Duration),
    Panicked,
}

impl RunError {
    fn is_transient(&self) -> bool {
        match self {
            RunError::Pipeline(e) => e.is_transient(),
            RunError::TimedOut(_) => true,
            RunError::Panicked => false,
        }
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Pipeline(e) => write!(f, "{e}"),
            RunError::TimedOut(limit) => write!(f, "timed out after {limit:?}"),
            RunError::Panicked => write!(f, "pipeline panicked"),
        }
    }
}

/// Runs the pipeline on its own thread so the time limits can be enforced.
///
/// A run past the hard limit is cancelled and abandoned: it stops at the
/// next stage boundary, leaving the item failed. Until then it keeps its
/// `slot` and its claim on the item.
fn run_with_limits(
    orchestrator: Arc<Orchestrator>,
    item_id: ItemId,
    config: &QueueConfig,
    slot: Slot,
) -> Result<ProcessingState, RunError> {
    let (tx, rx) = mpsc::channel();
    let cancel = Arc::new(AtomicBool::new(false));

    std::thread::spawn({
        let cancel = cancel.clone();
        move || {
            let _slot = slot;
            let _ = tx.send(orchestrator.process_until(item_id, &cancel));
        }
    });

    let soft = Duration::from_secs(config.soft_time_limit_secs);
    let hard = Duration::from_secs(config.hard_time_limit_secs);
    let started = Instant::now();

    let received = match rx.recv_timeout(soft) {
        Err(mpsc::RecvTimeoutError::Timeout) => {
            log::warn!("item {item_id}: pipeline still running after {soft:?}");
            rx.recv_timeout(hard.saturating_sub(started.elapsed()))
        }
        received => received,
    };

    match received {
        Ok(result) => result.map(|report| report.state).map_err(RunError::Pipeline),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            Err(RunError::TimedOut(hard))
        }
        // the sender is only dropped unsent when the pipeline thread panics
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(RunError::Panicked),
    }
}

/// Consumes tasks until `Task::Shutdown`, which waits for every accepted
/// task. Once `stop` is set, tasks that have not started yet are left
/// `Interrupted` in the dump and resumed on the next start.
pub fn start_queue(
    task_rx: mpsc::Receiver<Task>,
    orchestrator: Arc<Orchestrator>,
    queue_store: QueueStore,
    config: QueueConfig,
    stop: Arc<AtomicBool>,
) {
    let thread_ctr = Arc::new(AtomicU16::new(0));
    let running = Arc::new(AtomicU16::new(0));
    let config = Arc::new(config);

    log::debug!("waiting for job");
    while let Ok(task) = task_rx.recv() {
        let item_id = match task {
            Task::Process { item_id } => item_id,
            // graceful shutdown
            Task::Shutdown => {
                log::info!(
                    "shutting down, waiting for {} tasks",
                    thread_ctr.load(Ordering::Relaxed)
                );
                // abandoned runs still hold a slot until they stop
                while thread_ctr.load(Ordering::Relaxed) > 0 || running.load(Ordering::Acquire) > 0
                {
                    sleep(Duration::from_millis(100));
                }
                return;
            }
        };
        log::debug!("got the job for item {item_id}");

        let id = queue_store.save_task(task.clone(), Status::Pending);

        // counted before spawning so shutdown waits for queued tasks too
        thread_ctr.fetch_add(1, Ordering::Relaxed);

        let task_handle = std::thread::spawn({
            let running = running.clone();
            let orchestrator = orchestrator.clone();
            let queue_store = queue_store.clone();
            let config = config.clone();
            let stop = stop.clone();
            let id = id.clone();

            move || {
                let mut attempt = 0u8;
                loop {
                    if !throttle(&running, config.max_workers, &stop) {
                        queue_store.set_status(&id, Status::Interrupted);
                        return;
                    }
                    let slot = Slot(running.clone());
                    queue_store.set_status(&id, Status::InProgress);

                    let result = run_with_limits(orchestrator.clone(), item_id, &config, slot);

                    match result {
                        Ok(state) => {
                            queue_store.set_status(&id, Status::Done(state));
                            break;
                        }
                        Err(e) if attempt < config.max_retries && e.is_transient() => {
                            attempt += 1;
                            let delay = backoff(&config, attempt);
                            log::info!(
                                "task {id}: retrying item {item_id} (attempt {attempt}/{}) after error: {e}, backoff {delay:?}",
                                config.max_retries,
                            );
                            queue_store.set_attempt(&id, attempt);
                            queue_store.set_status(&id, Status::Pending);

                            if !sleep_unless_stopped(delay, &stop) {
                                queue_store.set_status(&id, Status::Interrupted);
                                return;
                            }
                        }
                        Err(e) => {
                            log::error!("task {id}: item {item_id} gave up: {e}");
                            if let Err(err) = orchestrator.mark_failed(item_id, &e.to_string()) {
                                log::error!("failed to mark item {item_id} as failed: {err}");
                            }
                            queue_store.set_status(&id, Status::Error(e.to_string()));
                            break;
                        }
                    }
                }

                // remove task a bit later to give client an opportunity to react
                let queue_store = queue_store.clone();
                std::thread::spawn(move || {
                    sleep(REMOVE_FINISHED_AFTER);
                    queue_store.remove_task(&id);
                });
            }
        });

        // handle thread panics
        std::thread::spawn({
            let thread_counter = thread_ctr.clone();
            let queue_store = queue_store.clone();
            move || {
                if let Err(err) = task_handle.join() {
                    log::error!("task_handle panicked: {err:?}");
                    queue_store.remove_task(&id);
                }

                thread_counter.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }
}
