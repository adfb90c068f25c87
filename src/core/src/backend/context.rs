use std::future::Future;

use common_exception::{FilterError, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Materialization;
use crate::cache::{CacheKey, MaterializationCache};
use crate::events::{EngineEvent, EventBus, Phase};
use crate::layer::LayerId;
use crate::task::TaskId;

/// Per-request execution state handed to a backend.
///
/// Cancellation is cooperative: adapters call [`ExecutionContext::checkpoint`]
/// between phases and stop at the first one after cancel was requested.
pub struct ExecutionContext {
    task: TaskId,
    layer: LayerId,
    cancel: CancellationToken,
    events: EventBus,
    cache: MaterializationCache,
}

impl ExecutionContext {
    pub fn new(
        task: TaskId,
        layer: LayerId,
        cancel: CancellationToken,
        events: EventBus,
        cache: MaterializationCache,
    ) -> Self {
        Self {
            task,
            layer,
            cancel,
            events,
            cache,
        }
    }

    pub fn task(&self) -> TaskId {
        self.task
    }

    pub fn layer(&self) -> &LayerId {
        &self.layer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`FilterError::Cancelled`] if cancellation was requested,
    /// otherwise reports entering `phase`.
    pub fn checkpoint(&self, phase: Phase) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(task = %self.task, layer = %self.layer, %phase, "cancelled at checkpoint");
            return Err(FilterError::Cancelled);
        }
        self.events.publish(EngineEvent::Progress {
            task: self.task,
            layer: self.layer.clone(),
            phase,
            fraction: phase.fraction(),
        });
        Ok(())
    }

    /// Fetches or builds the materialization for `key` through the cache.
    pub async fn materialize<F, Fut>(&self, key: CacheKey, builder: F) -> Result<Materialization>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Materialization>> + Send + 'static,
    {
        self.cache.get_or_build(key, builder).await
    }
}
