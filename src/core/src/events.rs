use std::fmt::{self, Display};

use tokio::sync::broadcast;

use crate::backend::BackendKind;
use crate::layer::LayerId;
use crate::task::{TaskId, TaskStatus};

const EVENT_CAPACITY: usize = 256;

/// Checkpoints an adapter passes through while executing a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    ResolveReference,
    BuildMaterialization,
    RunPredicate,
    ComputeCount,
}

impl Phase {
    /// Share of the request completed when the phase starts.
    pub fn fraction(&self) -> f32 {
        match self {
            Phase::ResolveReference => 0.0,
            Phase::BuildMaterialization => 0.25,
            Phase::RunPredicate => 0.5,
            Phase::ComputeCount => 0.75,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::ResolveReference => "resolve_reference",
            Phase::BuildMaterialization => "build_materialization",
            Phase::RunPredicate => "run_predicate",
            Phase::ComputeCount => "compute_count",
        };
        f.write_str(name)
    }
}

/// What the UI collaborator observes. The engine never calls into UI code.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TaskQueued {
        task: TaskId,
        layer: LayerId,
    },
    TaskStarted {
        task: TaskId,
        layer: LayerId,
    },
    Progress {
        task: TaskId,
        layer: LayerId,
        phase: Phase,
        fraction: f32,
    },
    /// Non-blocking performance or fallback notice.
    Advisory {
        layer: LayerId,
        backend: Option<BackendKind>,
        message: String,
    },
    TaskFinished {
        task: TaskId,
        layer: LayerId,
        status: TaskStatus,
        feature_count: Option<u64>,
        /// Set for failures: the error and the backend that was attempted.
        message: Option<String>,
    },
}

/// Broadcast channel for [`EngineEvent`]s; publishing without subscribers is
/// not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
