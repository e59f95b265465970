//! Registry of ephemeral dispatch threads: one entry per in-flight packet
//! callback, removed by the thread itself on completion and drained in bulk
//! at teardown.

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Completion flag a waiter can block on with a bound.
struct DoneSignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl DoneSignal {
    fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn mark(&self) {
        *self.flag.lock() = true;
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        *self.flag.lock()
    }

    /// Wait up to `timeout` for completion; true when the task finished.
    fn wait_for(&self, timeout: Duration) -> bool {
        let mut done = self.flag.lock();
        !self
            .cond
            .wait_while_for(&mut done, |d| !*d, timeout)
            .timed_out()
    }
}

struct TaskEntry {
    id: Uuid,
    label: &'static str,
    done: Arc<DoneSignal>,
    handle: thread::JoinHandle<()>,
}

/// Tracked set of ephemeral threads.
///
/// Each spawned thread removes its own entry when its closure returns, so the
/// registry only ever holds in-flight work. `drain` bounds the shutdown wait:
/// a thread still running past the budget is detached and logged, never
/// killed (a detached thread finishes on its own and unwinds normally).
pub struct TaskRegistry {
    tasks: Mutex<Vec<TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Run `f` on a new tracked thread. Fails only if the OS refuses the
    /// thread; the caller decides whether that is fatal.
    pub fn spawn(
        self: &Arc<Self>,
        label: &'static str,
        f: impl FnOnce() + Send + 'static,
    ) -> io::Result<Uuid> {
        let id = Uuid::new_v4();
        let done = Arc::new(DoneSignal::new());
        let thread_done = done.clone();
        let registry = Arc::downgrade(self);
        // Hold the list lock across spawn + push so a task that finishes
        // instantly blocks on its self-removal until its entry exists.
        let mut tasks = self.tasks.lock();
        let handle = thread::Builder::new()
            .name(format!("framelink-{label}"))
            .spawn(move || {
                f();
                thread_done.mark();
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            })?;
        tasks.push(TaskEntry {
            id,
            label,
            done,
            handle,
        });
        Ok(id)
    }

    /// Self-removal path: drop the entry for a finished task. The handle is
    /// dropped without joining, which is fine once `done` is marked.
    fn remove(&self, id: Uuid) {
        self.tasks.lock().retain(|t| t.id != id);
    }

    /// Reap every entry whose thread has finished.
    pub fn remove_terminated(&self) {
        let finished: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock();
            let mut out = Vec::new();
            let mut i = 0;
            while i < tasks.len() {
                if tasks[i].done.is_done() {
                    out.push(tasks.remove(i));
                } else {
                    i += 1;
                }
            }
            out
        };
        for task in finished {
            let _ = task.handle.join();
        }
    }

    /// Number of still-tracked tasks.
    pub fn active(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait for every tracked task. `None` waits indefinitely; `Some(t)`
    /// budgets `t` across the whole set and detaches any task still running
    /// once the budget is spent.
    pub fn drain(&self, timeout: Option<Duration>) {
        let entries: Vec<TaskEntry> = std::mem::take(&mut *self.tasks.lock());
        if entries.is_empty() {
            return;
        }
        debug!(count = entries.len(), "draining in-flight tasks");
        match timeout {
            None => {
                for task in entries {
                    let _ = task.handle.join();
                }
            }
            Some(budget) => {
                let deadline = Instant::now() + budget;
                for task in entries {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if task.done.wait_for(remaining) {
                        let _ = task.handle.join();
                    } else {
                        warn!(
                            id = %task.id,
                            label = task.label,
                            "task exceeded shutdown wait; detaching"
                        );
                        drop(task.handle);
                    }
                }
            }
        }
    }

    /// Drop every tracked entry unconditionally. Running threads are
    /// detached, not waited on.
    pub fn clear(&self) {
        let entries: Vec<TaskEntry> = std::mem::take(&mut *self.tasks.lock());
        if !entries.is_empty() {
            debug!(count = entries.len(), "clearing task registry");
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}
