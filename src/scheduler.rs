//! Scheduled-executor collaborator for periodic work.
//!
//! The runtime does not own an async runtime; periodic work (metric
//! auto-updates, range-sampler refreshes, adaptive-sampler adaptation) runs on
//! an injected [`Scheduler`]. The bundled [`ThreadPoolScheduler`] keeps one
//! coordinator thread ordering deadlines and a small worker pool executing
//! tasks, so a slow task occupies one worker without delaying the rest: every
//! scheduled task has its own entry and its ticks are skipped, not queued,
//! while a previous run is still in flight.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::vantage_warn;

/// Executes tasks periodically until their handle is cancelled.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run every `every`, starting one period from now.
    fn schedule(&self, every: Duration, task: Box<dyn FnMut() + Send>) -> ScheduleHandle;
}

/// Cancellation token for a scheduled task.
#[derive(Clone, Debug)]
pub struct ScheduleHandle {
    cancelled: Arc<AtomicBool>,
}

impl ScheduleHandle {
    fn live() -> ScheduleHandle {
        ScheduleHandle {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn dead() -> ScheduleHandle {
        ScheduleHandle {
            cancelled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Stops future runs. A run already in flight completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

type Task = Arc<Mutex<Box<dyn FnMut() + Send>>>;

struct Entry {
    next_due: Instant,
    seq: u64,
    every: Duration,
    task: Task,
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.next_due == other.next_due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed: BinaryHeap is a max-heap, the earliest deadline must win.
        other
            .next_due
            .cmp(&self.next_due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Command {
    Register(Entry),
    Shutdown,
}

struct Job {
    task: Task,
    cancelled: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

/// A [`Scheduler`] backed by a coordinator thread and a bounded worker pool.
pub struct ThreadPoolScheduler {
    control: Sender<Command>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    next_seq: std::sync::atomic::AtomicU64,
}

impl ThreadPoolScheduler {
    /// Starts a scheduler with `workers` executor threads (at least one).
    pub fn new(workers: usize) -> ThreadPoolScheduler {
        let workers = workers.max(1);
        let (control_tx, control_rx) = unbounded::<Command>();
        let (job_tx, job_rx) = bounded::<Job>(workers * 2);

        let mut threads = Vec::with_capacity(workers + 1);
        let coordinator = thread::Builder::new()
            .name("vantage-scheduler".to_owned())
            .spawn(move || coordinate(control_rx, job_tx))
            .expect("failed to spawn scheduler coordinator thread");
        threads.push(coordinator);

        for idx in 0..workers {
            let rx = job_rx.clone();
            let worker = thread::Builder::new()
                .name(format!("vantage-worker-{idx}"))
                .spawn(move || work(rx))
                .expect("failed to spawn scheduler worker thread");
            threads.push(worker);
        }

        ThreadPoolScheduler {
            control: control_tx,
            threads: Mutex::new(threads),
            next_seq: std::sync::atomic::AtomicU64::new(0),
        }
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn schedule(&self, every: Duration, task: Box<dyn FnMut() + Send>) -> ScheduleHandle {
        let every = if every.is_zero() {
            Duration::from_millis(1)
        } else {
            every
        };
        let handle = ScheduleHandle::live();
        let entry = Entry {
            next_due: Instant::now() + every,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            every,
            task: Arc::new(Mutex::new(task)),
            cancelled: handle.cancelled.clone(),
            running: Arc::new(AtomicBool::new(false)),
        };
        if self.control.send(Command::Register(entry)).is_err() {
            vantage_warn!(name: "Scheduler.RegisterAfterShutdown");
            return ScheduleHandle::dead();
        }
        handle
    }
}

impl Drop for ThreadPoolScheduler {
    fn drop(&mut self) {
        let _ = self.control.send(Command::Shutdown);
        let mut threads = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPoolScheduler").finish_non_exhaustive()
    }
}

fn coordinate(control: Receiver<Command>, jobs: Sender<Job>) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        let command = match heap.peek() {
            Some(entry) => {
                let wait = entry.next_due.saturating_duration_since(Instant::now());
                control.recv_timeout(wait)
            }
            None => control
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };

        match command {
            Ok(Command::Register(entry)) => heap.push(entry),
            Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let now = Instant::now();
        while heap.peek().map(|e| e.next_due <= now).unwrap_or(false) {
            let mut entry = heap.pop().expect("peeked entry is present");
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            // Skip the tick when the previous run is still in flight.
            if !entry.running.swap(true, Ordering::AcqRel) {
                let job = Job {
                    task: entry.task.clone(),
                    cancelled: entry.cancelled.clone(),
                    running: entry.running.clone(),
                };
                if jobs.send(job).is_err() {
                    return;
                }
            }
            let mut next = entry.next_due + entry.every;
            if next <= now {
                next = now + entry.every;
            }
            entry.next_due = next;
            heap.push(entry);
        }
    }
}

fn work(jobs: Receiver<Job>) {
    for job in jobs.iter() {
        if !job.cancelled.load(Ordering::Acquire) {
            let mut task = job.task.lock().unwrap_or_else(PoisonError::into_inner);
            let outcome = catch_unwind(AssertUnwindSafe(|| (task)()));
            if outcome.is_err() {
                vantage_warn!(name: "Scheduler.TaskPanicked");
            }
        }
        job.running.store(false, Ordering::Release);
    }
}
