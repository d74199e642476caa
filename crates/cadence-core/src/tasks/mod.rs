// crates/cadence-core/src/tasks/mod.rs
// Registry of in-flight slow-path tasks, with cancellation and a timeout reaper
//
// A TaskHandle is created when a slow-path unit starts and deregisters itself
// on drop. The reaper cancels and removes anything older than the configured
// timeout, independent of turn progress.

use crate::audit::{self, SharedSink};
use crate::config::ConfigHandle;
use cadence_types::AuditEvent;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

struct Entry {
    turn_number: u64,
    cancel: CancellationToken,
    started_at: Instant,
}

/// session_id -> task_id -> entry
type Tasks = HashMap<String, HashMap<TaskId, Entry>>;

fn remove_entry(tasks: &mut Tasks, session_id: &str, task_id: &TaskId) -> Option<Entry> {
    let session = tasks.get_mut(session_id)?;
    let entry = session.remove(task_id);
    if session.is_empty() {
        tasks.remove(session_id);
    }
    entry
}

/// Live slow-path task. Dropping it deregisters the task.
pub struct TaskHandle {
    task_id: TaskId,
    session_id: String,
    turn_number: u64,
    cancel: CancellationToken,
    started_at: Instant,
    tasks: Arc<Mutex<Tasks>>,
}

impl TaskHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn turn_number(&self) -> u64 {
        self.turn_number
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Token to select on at each suspension point
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        remove_entry(&mut self.tasks.lock(), &self.session_id, &self.task_id);
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.task_id)
            .field("session_id", &self.session_id)
            .field("turn_number", &self.turn_number)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<Tasks>>,
    config: ConfigHandle,
    audit: SharedSink,
}

impl TaskRegistry {
    pub fn new(config: ConfigHandle, audit: SharedSink) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            config,
            audit,
        }
    }

    pub fn register(&self, session_id: &str, turn_number: u64) -> TaskHandle {
        let handle = TaskHandle {
            task_id: TaskId::new(),
            session_id: session_id.to_string(),
            turn_number,
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
            tasks: self.tasks.clone(),
        };
        self.tasks
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(
                handle.task_id,
                Entry {
                    turn_number,
                    cancel: handle.cancel.clone(),
                    started_at: handle.started_at,
                },
            );
        debug!(session_id, turn = turn_number, task_id = %handle.task_id, "Task registered");
        handle
    }

    /// Remove a finished task. Returns false if it was already gone.
    pub fn complete(&self, handle: &TaskHandle) -> bool {
        remove_entry(&mut self.tasks.lock(), &handle.session_id, &handle.task_id).is_some()
    }

    /// Cancel and remove every task of one turn; returns how many were live
    pub fn cancel_all(&self, session_id: &str, turn_number: u64) -> usize {
        let cancelled: Vec<Entry> = {
            let mut tasks = self.tasks.lock();
            let Some(session) = tasks.get_mut(session_id) else {
                return 0;
            };
            let ids: Vec<TaskId> = session
                .iter()
                .filter(|(_, e)| e.turn_number == turn_number)
                .map(|(id, _)| *id)
                .collect();
            let removed = ids.iter().filter_map(|id| session.remove(id)).collect();
            if session.is_empty() {
                tasks.remove(session_id);
            }
            removed
        };

        for entry in &cancelled {
            entry.cancel.cancel();
        }
        if !cancelled.is_empty() {
            info!(
                session_id,
                turn = turn_number,
                count = cancelled.len(),
                "Cancelled slow-path tasks"
            );
        }
        cancelled.len()
    }

    /// Cancel and remove tasks older than the configured timeout
    pub fn cleanup_expired(&self) -> usize {
        let timeout = self.config.snapshot().tasks.timeout();
        let now = Instant::now();

        let mut expired = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            for (session_id, session) in tasks.iter_mut() {
                let ids: Vec<TaskId> = session
                    .iter()
                    .filter(|(_, e)| now.duration_since(e.started_at) >= timeout)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    if let Some(entry) = session.remove(&id) {
                        expired.push((session_id.clone(), id, entry));
                    }
                }
            }
            tasks.retain(|_, session| !session.is_empty());
        }

        for (session_id, task_id, entry) in &expired {
            entry.cancel.cancel();
            let age = now.duration_since(entry.started_at);
            warn!(
                session_id = %session_id,
                turn = entry.turn_number,
                task_id = %task_id,
                age_secs = age.as_secs(),
                "Slow-path task timed out"
            );
            self.audit.append(audit::record(
                Some(session_id),
                Some(entry.turn_number),
                AuditEvent::TaskTimeout {
                    task_id: task_id.to_string(),
                    age_secs: age.as_secs(),
                },
            ));
        }
        expired.len()
    }

    pub fn live_count(&self, session_id: &str, turn_number: u64) -> usize {
        self.tasks.lock().get(session_id).map_or(0, |session| {
            session
                .values()
                .filter(|e| e.turn_number == turn_number)
                .count()
        })
    }

    pub fn total_live(&self) -> usize {
        self.tasks.lock().values().map(HashMap::len).sum()
    }

    /// Run `cleanup_expired` every sweep interval until shutdown is signalled.
    ///
    /// The interval is re-read from config after each sweep.
    pub fn spawn_reaper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            info!("Task reaper started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                let interval = registry.config.snapshot().tasks.sweep_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval.max(Duration::from_millis(10))) => {
                        let removed = registry.cleanup_expired();
                        if removed > 0 {
                            info!(removed, "Reaper sweep");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Task reaper shutting down");
        })
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("live", &self.total_live())
            .finish()
    }
}
