//! Ray tracing acceleration structures via `VK_KHR_acceleration_structure`.
//!
//! Bottom-level structures are batched by size, the top-level structure is
//! built over packed instance records and can be refit in place.

pub mod acceleration;
pub mod batch;
pub mod instance;

pub use acceleration::{AccelerationStructure, AccelerationStructureBuilder, BlasRecord, BuildState};
pub use batch::{batch_by_limit, BatchGroup};
pub use instance::{GpuInstance, TlasInstance};
