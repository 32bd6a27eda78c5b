use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A timed callback.
///
/// `run` is invoked on the task-manager worker at or after the deadline;
/// returning `Some(next)` reschedules the task, `None` drops it.
pub trait Task: Send {
    fn run(&mut self, now: Instant) -> Option<Instant>;

    fn name(&self) -> &str {
        "task"
    }
}

/// Identifier handed out by [`TaskManager::register`], usable to cancel
/// the task before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

struct TaskEntry {
    id: u64,
    deadline: Instant,
    task: Box<dyn Task>,
}

struct TaskInner {
    next_id: u64,
    tasks: Vec<TaskEntry>,
    cancelled: HashSet<u64>,
}

/// Timed-callback scheduler on a dedicated worker.
///
/// Drives deferred re-sends after `wait`, reconnection back-off, and the
/// periodic timeout sweeps of the channels.
pub struct TaskManager {
    inner: Arc<Mutex<TaskInner>>,
    cancel: CancellationToken,
    resolution: Duration,
    started: AtomicBool,
}

impl TaskManager {
    pub fn new(resolution: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TaskInner {
                next_id: 1,
                tasks: Vec::new(),
                cancelled: HashSet::new(),
            })),
            cancel: CancellationToken::new(),
            resolution,
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the worker. A second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Starting the task manager");
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let resolution = self.resolution;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Task manager stopped");
                        return;
                    }
                    _ = tokio::time::sleep(resolution) => {}
                }
                run_due(&inner);
            }
        });
    }

    /// Stop the worker; pending tasks never fire. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run `task` at or after `deadline`.
    pub fn register(&self, task: Box<dyn Task>, deadline: Instant) -> TaskId {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        trace!(task = task.name(), "Registering task");
        inner.tasks.push(TaskEntry { id, deadline, task });
        TaskId(id)
    }

    /// Drop a task that has not run yet.
    pub fn unregister(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.retain(|entry| entry.id != id.0);
        // a task mid-run re-checks this set before rescheduling itself
        inner.cancelled.insert(id.0);
    }
}

/// Pull due tasks out, run them without the lock held (a task may
/// register or unregister others), and reschedule the periodic ones.
fn run_due(inner: &Arc<Mutex<TaskInner>>) {
    let now = Instant::now();
    let due: Vec<TaskEntry> = {
        let mut guard = inner.lock().unwrap();
        let mut due = Vec::new();
        let mut kept = Vec::with_capacity(guard.tasks.len());
        for entry in guard.tasks.drain(..) {
            if entry.deadline <= now {
                due.push(entry);
            } else {
                kept.push(entry);
            }
        }
        guard.tasks = kept;
        due
    };

    for mut entry in due {
        trace!(task = entry.task.name(), "Running task");
        let next = entry.task.run(now);
        if let Some(deadline) = next {
            let mut guard = inner.lock().unwrap();
            if guard.cancelled.remove(&entry.id) {
                continue;
            }
            entry.deadline = deadline;
            guard.tasks.push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingTask {
        counter: Arc<AtomicU32>,
        repeat: Option<Duration>,
    }

    impl Task for CountingTask {
        fn run(&mut self, now: Instant) -> Option<Instant> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            self.repeat.map(|d| now + d)
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_one_shot_runs_once() {
        let mgr = TaskManager::new(Duration::from_millis(20));
        mgr.start();
        let counter = Arc::new(AtomicU32::new(0));
        mgr.register(
            Box::new(CountingTask {
                counter: counter.clone(),
                repeat: None,
            }),
            Instant::now(),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        mgr.stop();
    }

    #[tokio::test]
    async fn test_periodic_reschedules() {
        let mgr = TaskManager::new(Duration::from_millis(10));
        mgr.start();
        let counter = Arc::new(AtomicU32::new(0));
        mgr.register(
            Box::new(CountingTask {
                counter: counter.clone(),
                repeat: Some(Duration::from_millis(10)),
            }),
            Instant::now(),
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(counter.load(Ordering::SeqCst) >= 3);
        mgr.stop();
    }

    #[tokio::test]
    async fn test_unregister_before_run() {
        let mgr = TaskManager::new(Duration::from_millis(10));
        mgr.start();
        let counter = Arc::new(AtomicU32::new(0));
        let id = mgr.register(
            Box::new(CountingTask {
                counter: counter.clone(),
                repeat: None,
            }),
            Instant::now() + Duration::from_millis(100),
        );
        mgr.unregister(id);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        mgr.stop();
    }

    #[tokio::test]
    async fn test_deadline_in_future() {
        let mgr = TaskManager::new(Duration::from_millis(10));
        mgr.start();
        let counter = Arc::new(AtomicU32::new(0));
        mgr.register(
            Box::new(CountingTask {
                counter: counter.clone(),
                repeat: None,
            }),
            Instant::now() + Duration::from_millis(150),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "ran before its deadline");
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        mgr.stop();
    }
}
