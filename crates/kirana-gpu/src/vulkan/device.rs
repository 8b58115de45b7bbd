//! The device seam: every driver call the allocator, the submission pool and
//! the structure builder make goes through [`GpuDevice`].
//!
//! [`super::VulkanDevice`] implements it over `ash` and `gpu-allocator`. The
//! components only ever hold a `&D`, so the device always outlives its users.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use std::ptr::NonNull;

use super::error::GpuResult;

/// Memory backing a buffer or image.
pub trait DeviceAllocation {
    /// Host pointer to the start of the allocation, if its memory is host-visible.
    fn mapped_ptr(&self) -> Option<NonNull<u8>>;

    /// Property flags of the memory type the allocation landed in.
    fn memory_properties(&self) -> vk::MemoryPropertyFlags;

    fn size(&self) -> vk::DeviceSize;
}

impl DeviceAllocation for Allocation {
    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        Allocation::mapped_ptr(self).map(|p| p.cast::<u8>())
    }

    fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        Allocation::memory_properties(self)
    }

    fn size(&self) -> vk::DeviceSize {
        Allocation::size(self)
    }
}

/// Logical device, transfer queue and acceleration-structure entry points.
///
/// Handles passed back into these methods must have been created by the same
/// device. Commands recorded through the `cmd_*` methods only take effect once
/// the command buffer is submitted.
pub trait GpuDevice {
    type Allocation: DeviceAllocation;

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Create a buffer and bind it to freshly allocated memory at `location`.
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<(vk::Buffer, Self::Allocation)>;

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Self::Allocation);

    /// Create an image and bind it to freshly allocated memory at `location`.
    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<(vk::Image, Self::Allocation)>;

    fn destroy_image(&self, image: vk::Image, allocation: Self::Allocation);

    /// Device address of a buffer created with `SHADER_DEVICE_ADDRESS` usage.
    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress;

    // ------------------------------------------------------------------
    // Command recording
    // ------------------------------------------------------------------

    /// Create a resettable command pool on the queue family used for submissions.
    fn create_command_pool(&self) -> GpuResult<vk::CommandPool>;

    /// Destroy a pool, implicitly freeing every command buffer allocated from it.
    fn destroy_command_pool(&self, pool: vk::CommandPool);

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer>;

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;

    /// Begin a one-time-submit recording.
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    );

    // ------------------------------------------------------------------
    // Submission and synchronization
    // ------------------------------------------------------------------

    /// Create an unsignaled fence.
    fn create_fence(&self) -> GpuResult<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;

    /// Block until `fence` signals. Returns [`super::GpuError::FenceTimeout`]
    /// when `timeout_ns` elapses first.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()>;

    fn queue_submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> GpuResult<()>;

    fn queue_wait_idle(&self) -> GpuResult<()>;

    // ------------------------------------------------------------------
    // Acceleration structures
    // ------------------------------------------------------------------

    /// `minAccelerationStructureScratchOffsetAlignment` of the physical device.
    fn min_scratch_offset_alignment(&self) -> vk::DeviceSize;

    /// Structure, build-scratch and update-scratch sizes for a device build.
    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> GpuResult<vk::AccelerationStructureBuildSizesInfoKHR<'static>>;

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> GpuResult<vk::AccelerationStructureKHR>;

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR);

    fn acceleration_structure_device_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress;

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    );

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    );

    /// Create a query pool holding `count` compacted-size queries.
    fn create_compaction_query_pool(&self, count: u32) -> GpuResult<vk::QueryPool>;

    fn destroy_query_pool(&self, pool: vk::QueryPool);

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32);

    /// Record a compacted-size query for each structure, starting at `first_query`.
    fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first_query: u32,
    );

    /// Read back `count` compacted sizes. Only valid after the recording
    /// submission has been fence-confirmed.
    fn compacted_sizes(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Vec<vk::DeviceSize>>;
}
