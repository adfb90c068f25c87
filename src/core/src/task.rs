//! Background execution of filter requests.
//!
//! A task's cleanup callbacks are owned by a [`CleanupGuard`] that is armed
//! before the task body starts and fires exactly once: when the body returns,
//! fails, panics, is cancelled, or the task future is dropped. Nothing the body
//! does can skip it.

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use common_exception::{FilterError, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::BackendKind;
use crate::events::{EngineEvent, EventBus};
use crate::layer::LayerId;
use crate::request::FilterResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn of(outcome: &Result<FilterResult>) -> Self {
        match outcome {
            Ok(_) => TaskStatus::Succeeded,
            Err(e) if e.is_cancelled() => TaskStatus::Cancelled,
            Err(_) => TaskStatus::Failed,
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Runs once with the task's terminal status.
pub type CleanupCallback = Box<dyn FnOnce(TaskStatus) + Send + 'static>;

/// Owns a task's cleanup callbacks and runs them exactly once.
pub struct CleanupGuard {
    callbacks: Vec<CleanupCallback>,
}

impl CleanupGuard {
    pub fn new(callbacks: Vec<CleanupCallback>) -> Self {
        Self { callbacks }
    }

    pub fn push(&mut self, callback: CleanupCallback) {
        self.callbacks.push(callback);
    }

    /// Runs the callbacks now with the given status.
    pub fn finish(mut self, status: TaskStatus) {
        self.run(status);
    }

    fn run(&mut self, status: TaskStatus) {
        for callback in self.callbacks.drain(..) {
            // A panicking callback must not stop the ones after it.
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                error!(%status, "cleanup callback panicked");
            }
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.callbacks.is_empty() {
            return;
        }
        let status = if std::thread::panicking() {
            TaskStatus::Failed
        } else {
            TaskStatus::Cancelled
        };
        self.run(status);
    }
}

/// What a task body gets to see.
#[derive(Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub layer: LayerId,
    pub cancel: CancellationToken,
    pub events: EventBus,
    backend: Arc<Mutex<Option<BackendKind>>>,
}

impl TaskContext {
    /// A context not driven by an orchestrator, for direct engine calls.
    pub fn detached(layer: LayerId, events: EventBus) -> Self {
        Self {
            id: TaskId(0),
            layer,
            cancel: CancellationToken::new(),
            events,
            backend: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records the backend the task is using, for failure reports.
    pub fn set_backend(&self, kind: BackendKind) {
        *self.backend.lock() = Some(kind);
    }

    pub fn backend(&self) -> Option<BackendKind> {
        *self.backend.lock()
    }
}

#[derive(Debug, Clone)]
struct TaskState {
    status: TaskStatus,
    outcome: Option<Result<FilterResult>>,
}

/// Observes and controls one submitted task.
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    layer: LayerId,
    cancel: CancellationToken,
    state: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn layer(&self) -> &LayerId {
        &self.layer
    }

    pub fn status(&self) -> TaskStatus {
        self.state.borrow().status
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Requests cooperative cancellation; the task stops at its next
    /// checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the terminal state. Cleanup callbacks have already run when
    /// this returns.
    pub async fn wait(&self) -> Result<FilterResult> {
        let mut state = self.state.clone();
        let finished = state
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| FilterError::Internal(format!("{} vanished", self.id)))?;
        finished
            .outcome
            .clone()
            .unwrap_or_else(|| Err(FilterError::Internal(format!("{} has no outcome", self.id))))
    }
}

/// Runs task bodies on the runtime and tracks them for cancellation.
pub struct TaskOrchestrator {
    next_id: AtomicU64,
    events: EventBus,
    running: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
}

impl TaskOrchestrator {
    pub fn new(events: EventBus) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn run<F, Fut>(
        &self,
        layer: LayerId,
        cleanups: Vec<CleanupCallback>,
        work: F,
    ) -> TaskHandle
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<FilterResult>> + Send + 'static,
    {
        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        let (sender, receiver) = watch::channel(TaskState {
            status: TaskStatus::Pending,
            outcome: None,
        });
        // Armed here, before the body can branch.
        let guard = CleanupGuard::new(cleanups);
        let ctx = TaskContext {
            id,
            layer: layer.clone(),
            cancel: cancel.clone(),
            events: self.events.clone(),
            backend: Arc::new(Mutex::new(None)),
        };
        self.running.lock().insert(id, cancel.clone());

        let running = Arc::clone(&self.running);
        let events = self.events.clone();
        let task_layer = layer.clone();
        tokio::spawn(async move {
            sender.send_modify(|state| state.status = TaskStatus::Running);
            events.publish(EngineEvent::TaskStarted {
                task: id,
                layer: task_layer.clone(),
            });

            let body_ctx = ctx.clone();
            let outcome = AssertUnwindSafe(async move { work(body_ctx).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(FilterError::Internal(format!(
                        "task panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });
            let status = TaskStatus::of(&outcome);
            guard.finish(status);
            running.lock().remove(&id);

            let (feature_count, message) = match &outcome {
                Ok(result) => (result.feature_count, None),
                Err(FilterError::Cancelled) => (None, None),
                Err(e) => (None, Some(failure_message(e, ctx.backend()))),
            };
            match &message {
                Some(message) => info!(task = %id, layer = %task_layer, %status, message, "task finished"),
                None => info!(task = %id, layer = %task_layer, %status, feature_count, "task finished"),
            }
            events.publish(EngineEvent::TaskFinished {
                task: id,
                layer: task_layer,
                status,
                feature_count,
                message,
            });
            sender.send_replace(TaskState {
                status,
                outcome: Some(outcome),
            });
        });

        TaskHandle {
            id,
            layer,
            cancel,
            state: receiver,
        }
    }

    pub fn cancel(&self, task: TaskId) -> bool {
        match self.running.lock().get(&task) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let running = self.running.lock();
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub fn active_count(&self) -> usize {
        self.running.lock().len()
    }
}

fn failure_message(err: &FilterError, backend: Option<BackendKind>) -> String {
    match backend {
        Some(kind) => format!("{err} (backend: {kind})"),
        None => err.to_string(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
