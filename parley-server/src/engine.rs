//! Job queue and timer dispatch.
//!
//! All channel state changes run as jobs on a shared FIFO queue served by a
//! fixed pool of worker tasks. Timed events sit in a separate ordered queue
//! until due, then move onto the job queue like any other work. Timer
//! cancellation is advisory: a callback already moved to the job queue will
//! still run.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::now_ms;
use crate::stats::Statistics;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

enum QueueEntry {
    Job(Job),
    /// Sentinel consumed by exactly one worker during shutdown.
    Shutdown,
}

struct TimerQueue {
    /// Due time plus an id for uniqueness; iteration order is fire order.
    by_time: BTreeMap<(i64, u64), Job>,
    by_id: HashMap<u64, i64>,
    next_id: u64,
}

struct EngineShared {
    queue: Mutex<VecDeque<QueueEntry>>,
    queue_notify: Notify,
    timers: Mutex<TimerQueue>,
    timer_notify: Notify,
    closing: AtomicBool,
    stats: Arc<Statistics>,
}

/// The dispatch engine. Cheap to clone by way of `Arc`; owned handles to
/// the worker and timer tasks live on the instance returned by [`new`].
///
/// [`new`]: EventHandler::new
pub struct EventHandler {
    shared: Arc<EngineShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    timer_task: Mutex<Option<JoinHandle<()>>>,
}

impl EventHandler {
    pub fn new(worker_count: usize, stats: Arc<Statistics>) -> Arc<Self> {
        let shared = Arc::new(EngineShared {
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            timers: Mutex::new(TimerQueue {
                by_time: BTreeMap::new(),
                by_id: HashMap::new(),
                next_id: 0,
            }),
            timer_notify: Notify::new(),
            closing: AtomicBool::new(false),
            stats,
        });

        let workers = (0..worker_count)
            .map(|index| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { worker_loop(shared, index).await })
            })
            .collect();

        let timer_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move { timer_loop(shared).await })
        };

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
            timer_task: Mutex::new(Some(timer_task)),
        })
    }

    /// Queue a job for execution. Jobs run in FIFO order, though two jobs
    /// may run concurrently on different workers. Jobs submitted after
    /// shutdown has begun are dropped.
    pub fn add_event(&self, job: Job) {
        if self.shared.closing.load(Ordering::SeqCst) {
            tracing::debug!("job dropped, engine closing");
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            queue.push_back(QueueEntry::Job(job));
        }
        self.shared.queue_notify.notify_one();
    }

    /// Queue a job to run at `at_ms` (milliseconds since epoch). Returns an
    /// id usable with [`remove_timed_event`].
    ///
    /// [`remove_timed_event`]: EventHandler::remove_timed_event
    pub fn add_timed_event(&self, at_ms: i64, job: Job) -> u64 {
        let id = {
            let mut timers = self.shared.timers.lock();
            let id = timers.next_id;
            timers.next_id += 1;
            if !self.shared.closing.load(Ordering::SeqCst) {
                timers.by_time.insert((at_ms, id), job);
                timers.by_id.insert(id, at_ms);
            }
            id
        };
        self.shared.timer_notify.notify_one();
        id
    }

    /// Cancel a timed event if it has not fired yet. Returns whether the
    /// event was still pending.
    pub fn remove_timed_event(&self, id: u64) -> bool {
        let mut timers = self.shared.timers.lock();
        match timers.by_id.remove(&id) {
            Some(at_ms) => {
                timers.by_time.remove(&(at_ms, id));
                true
            }
            None => false,
        }
    }

    /// Stop the timer task, run every queued job to completion and stop the
    /// workers. Pending timed events that have not fired are discarded.
    pub async fn close(&self) {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.shared.timer_notify.notify_one();
        let timer_task = self.timer_task.lock().take();
        if let Some(handle) = timer_task {
            let _ = handle.await;
        }
        {
            let mut timers = self.shared.timers.lock();
            timers.by_time.clear();
            timers.by_id.clear();
        }

        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        {
            let mut queue = self.shared.queue.lock();
            for _ in 0..workers.len() {
                queue.push_back(QueueEntry::Shutdown);
            }
        }
        self.shared.queue_notify.notify_one();
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(shared: Arc<EngineShared>, index: usize) {
    loop {
        let entry = shared.queue.lock().pop_front();
        match entry {
            Some(QueueEntry::Job(job)) => {
                let started = Instant::now();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".into());
                    tracing::error!(worker = index, %detail, "job panicked");
                }
                shared
                    .stats
                    .update_time_statistic("event", started.elapsed().as_millis() as u64);
            }
            Some(QueueEntry::Shutdown) => {
                // Pass the wakeup on so the next worker sees its sentinel.
                shared.queue_notify.notify_one();
                break;
            }
            None => {
                shared.queue_notify.notified().await;
            }
        }
    }
}

async fn timer_loop(shared: Arc<EngineShared>) {
    loop {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }

        // Move everything due onto the job queue.
        let next_due = {
            let mut timers = shared.timers.lock();
            let now = now_ms();
            let mut moved = false;
            while let Some((&(at_ms, id), _)) = timers.by_time.first_key_value() {
                if at_ms > now {
                    break;
                }
                let job = timers.by_time.remove(&(at_ms, id)).expect("due timer");
                timers.by_id.remove(&id);
                shared.queue.lock().push_back(QueueEntry::Job(job));
                moved = true;
            }
            if moved {
                shared.queue_notify.notify_one();
            }
            timers.by_time.first_key_value().map(|(&(at_ms, _), _)| at_ms)
        };

        match next_due {
            Some(at_ms) => {
                let wait = (at_ms - now_ms()).max(0) as u64;
                tokio::select! {
                    _ = shared.timer_notify.notified() => {}
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait)) => {}
                }
            }
            None => {
                shared.timer_notify.notified().await;
            }
        }
    }
}
