//! Vulkan backend: device memory, command submission and ray tracing
//! acceleration structures.

pub mod commands;
pub mod context;
pub mod device;
pub mod error;
pub mod memory;
pub mod raytracing;
pub mod render_config;

#[cfg(test)]
pub(crate) mod mock;

pub use commands::CommandSubmissionPool;
pub use context::{RtCapabilities, VulkanDevice};
pub use device::{DeviceAllocation, GpuDevice};
pub use error::{check_vk_result, GpuError, GpuResult};
pub use memory::{AllocatedBuffer, AllocatedImage, AllocationPolicy, MemoryAllocator};
pub use render_config::{BuildPreference, RtBuildConfig};

use ash::vk;
use std::ffi::CStr;

/// Buffer device address and acceleration structures are core from 1.2 onward.
pub const REQUIRED_VK_VERSION: u32 = vk::make_api_version(0, 1, 2, 0);

/// Application name for Vulkan instance.
pub const APP_NAME: &CStr = c"Kirana";

/// Engine name for Vulkan instance.
pub const ENGINE_NAME: &CStr = c"Kirana Viewport";

/// Engine version.
pub const ENGINE_VERSION: u32 = vk::make_api_version(0, 0, 1, 0);

/// Align a value up to the given alignment (must be a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
