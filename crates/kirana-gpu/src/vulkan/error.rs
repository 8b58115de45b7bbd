//! Error types for GPU resource management and acceleration structure builds.

use ash::vk;
use thiserror::Error;

/// Result alias used throughout the GPU layer.
pub type GpuResult<T> = Result<T, GpuError>;

/// Failure raised by the allocator, the submission pool or the structure builder.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Device out of memory, or the driver rejected the buffer/image.
    #[error("allocation of '{name}' failed: {reason}")]
    Allocation { name: String, reason: String },

    #[error("build size query failed: {0}")]
    BuildSizeQuery(String),

    #[error("fence wait timed out after {0} ns")]
    FenceTimeout(u64),

    #[error("top-level structure already exists; request an update instead of a rebuild")]
    InvalidRebuildRequest,

    #[error("mesh {mesh}: {reason}")]
    UnsupportedGeometry { mesh: usize, reason: String },

    #[error("memory backing '{0}' is not host-visible and cannot be mapped")]
    MapFailed(String),

    #[error("access of {len} bytes at offset {offset} exceeds '{name}' ({capacity} bytes)")]
    OutOfBounds {
        name: String,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("{operation} requires state {expected}, builder is {actual}")]
    InvalidState {
        operation: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("instance count changed from {built} to {requested}; updates must keep the count")]
    InstanceCountMismatch { built: u32, requested: u32 },

    #[error("no instance with global index {0}")]
    UnknownInstance(u32),

    #[error("submission pool is unusable after an earlier fence timeout")]
    SubmissionLost,

    #[error("Vulkan initialization failed: {0}")]
    Init(String),

    #[error("ray tracing is not supported: {0}")]
    RayTracingUnsupported(String),

    #[error("Vulkan error during {operation}: {result:?}")]
    Vulkan {
        operation: &'static str,
        result: vk::Result,
    },
}

impl GpuError {
    /// Wrap a raw driver result with the name of the call that produced it.
    pub fn vulkan(operation: &'static str, result: vk::Result) -> Self {
        GpuError::Vulkan { operation, result }
    }

    pub fn allocation(name: &str, reason: impl Into<String>) -> Self {
        GpuError::Allocation {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the error came from the device running out of memory.
    pub fn is_out_of_memory(&self) -> bool {
        match self {
            GpuError::Vulkan { result, .. } => matches!(
                *result,
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
            ),
            GpuError::Allocation { .. } => true,
            _ => false,
        }
    }
}

/// Check if a Vulkan result is successful, converting it into a [`GpuError`] if not.
pub fn check_vk_result(operation: &'static str, result: vk::Result) -> GpuResult<()> {
    if result == vk::Result::SUCCESS {
        Ok(())
    } else {
        Err(GpuError::vulkan(operation, result))
    }
}
