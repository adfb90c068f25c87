//! Spatial and attribute filtering of vector layers over three storage
//! engines: a PostGIS server, an embedded SQLite database, and an in-process
//! engine for everything else.

pub mod attribute;
pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod environment;
pub mod events;
pub mod history;
pub mod host;
pub mod layer;
pub mod probe;
pub mod request;
pub mod selector;
pub mod service;
pub mod task;

pub use backend::{Backend, BackendCapabilities, BackendKind, BackendPort};
pub use cache::{CacheEntry, CacheKey, MaterializationCache};
pub use config::EngineConfig;
pub use engine::{EnginePhase, FilterEngine};
pub use environment::{DriverStatus, EnvironmentCapabilities};
pub use events::{EngineEvent, EventBus, Phase};
pub use host::{FeatureScope, HostLayers, InMemoryHost};
pub use layer::{AttrValue, Feature, LayerId, LayerRef, LayerSource, StorageKind};
pub use probe::{CapabilityProbe, RankedBackend, RankedBackends, RejectedBackend};
pub use request::{FilterRequest, FilterResult, ReferenceSource, SpatialFilter};
pub use selector::{BackendFactory, BackendSelector, Selection};
pub use service::FilterService;
pub use task::{
    CleanupCallback, CleanupGuard, TaskContext, TaskHandle, TaskId, TaskOrchestrator, TaskStatus,
};
