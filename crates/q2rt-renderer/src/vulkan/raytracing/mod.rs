//! Ray tracing support via Vulkan KHR extensions.
//!
//! Implements the pipeline's GPU collaborator interfaces: geometry buffer
//! creation and bottom-level acceleration-structure builds.

pub mod acceleration;

pub use acceleration::{AccelerationStructureManager, Blas, GeometryBuffers};
