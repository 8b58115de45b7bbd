//! GPU resource and ray tracing acceleration structure layer of the Kirana
//! viewport.
//!
//! [`vulkan::MemoryAllocator`] places buffers and images under an
//! [`vulkan::AllocationPolicy`], [`vulkan::CommandSubmissionPool`] runs
//! fence-gated one-shot submissions, and
//! [`vulkan::raytracing::AccelerationStructureBuilder`] turns a
//! [`scene::SceneData`] into a top-level acceleration structure.

pub mod logging;
pub mod scene;
pub mod vulkan;

pub use scene::{InstanceFlags, MeshDescriptor, MeshInstance, SceneData};
pub use vulkan::raytracing::{AccelerationStructureBuilder, BuildState};
pub use vulkan::{
    AllocatedBuffer, AllocatedImage, AllocationPolicy, BuildPreference, CommandSubmissionPool, GpuDevice,
    GpuError, GpuResult, MemoryAllocator, RtBuildConfig, VulkanDevice,
};
