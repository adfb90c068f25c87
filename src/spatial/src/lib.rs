//! Geometry model and predicate evaluation shared by every backend.
//!
//! The server and embedded engines evaluate predicates natively; this crate
//! is what the generic engine runs in process, and what the embedded engine
//! registers as SQL functions, so all engines agree on the semantics of a
//! predicate, a buffer, and a repaired reference geometry.

mod buffer;
mod geometry;
mod index;
mod predicate;
mod refine;
mod repair;
mod simplify;

pub use buffer::buffer_geometry;
pub use geometry::{Geometry, envelope, geometry_from_wkt, geometry_to_wkt, is_empty};
pub use index::FeatureIndex;
pub use predicate::SpatialRelation;
pub use refine::{PreparedReference, evaluate};
pub use repair::{RepairStrategy, Repaired, repair_geometry};
