#![allow(clippy::too_many_arguments, clippy::needless_range_loop, clippy::float_cmp)]
// BSP map loading and ray-tracing geometry pipeline.
//
// The pipeline runs strictly forward: file bytes -> typed lumps ->
// per-leaf meshes -> bottom-level acceleration structures.

// Vulkan backend (concrete collaborator implementations)
pub mod vulkan;

// Map pipeline modules
pub mod rt_local;
pub mod rt_model;
pub mod rt_light;
pub mod rt_surf;
pub mod rt_image;
pub mod rt_accel;
