//! Recording device for unit tests.
//!
//! Memory is host-backed, copies run when their command buffer is submitted,
//! and every recorded command is kept for inspection.

use ash::vk::{self, Handle};
use gpu_allocator::MemoryLocation;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::rc::Rc;

use super::device::{DeviceAllocation, GpuDevice};
use super::error::{GpuError, GpuResult};

/// Install the test logger once per process.
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A command as seen by the mock queue.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
    },
    ImageBarrier {
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    MemoryBarrier {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
    },
    BuildAccelerationStructure {
        ty: vk::AccelerationStructureTypeKHR,
        mode: vk::BuildAccelerationStructureModeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        scratch_address: vk::DeviceAddress,
        geometry_count: u32,
        primitive_count: u32,
    },
    CopyAccelerationStructure {
        src: vk::AccelerationStructureKHR,
        dst: vk::AccelerationStructureKHR,
        mode: vk::CopyAccelerationStructureModeKHR,
    },
    ResetQueryPool {
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    WriteCompactedSizes {
        structures: Vec<vk::AccelerationStructureKHR>,
        pool: vk::QueryPool,
        first_query: u32,
    },
}

/// Host-backed allocation.
pub(crate) struct MockAllocation {
    memory: Rc<[Cell<u8>]>,
    properties: vk::MemoryPropertyFlags,
}

impl DeviceAllocation for MockAllocation {
    fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        if self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            NonNull::new(Rc::as_ptr(&self.memory) as *const Cell<u8> as *mut u8)
        } else {
            None
        }
    }

    fn memory_properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    fn size(&self) -> vk::DeviceSize {
        self.memory.len() as vk::DeviceSize
    }
}

struct MockStructure {
    size: vk::DeviceSize,
    ty: vk::AccelerationStructureTypeKHR,
}

#[derive(Default)]
struct State {
    buffers: HashMap<u64, Rc<[Cell<u8>]>>,
    images: HashSet<u64>,
    pools: HashSet<u64>,
    fences: HashSet<u64>,
    query_pools: HashMap<u64, Vec<vk::DeviceSize>>,
    structures: HashMap<u64, MockStructure>,
    recordings: HashMap<u64, Vec<Command>>,
    submissions: Vec<Vec<Command>>,
    allocated_command_buffers: usize,
    invalid_frees: usize,
    in_flight_frees: usize,
    idle_waits: usize,
    failing_buffer_names: Vec<String>,
}

/// In-memory [`GpuDevice`].
pub(crate) struct MockDevice {
    state: RefCell<State>,
    next_handle: Cell<u64>,
    resizable_bar: Cell<bool>,
    /// Successful fence waits left before one times out.
    fence_waits_before_timeout: Cell<Option<usize>>,
    fail_next_fence_reset: Cell<bool>,
    fail_next_submit: Cell<bool>,
    /// Set by a timed-out wait, cleared by `queue_wait_idle`.
    work_in_flight: Cell<bool>,
    zero_size_queries: Cell<bool>,
    blas_bytes_per_primitive: Cell<vk::DeviceSize>,
}

pub(crate) const MOCK_SCRATCH_ALIGNMENT: vk::DeviceSize = 128;

/// Larger than any buffer a test has a reason to back with real memory.
const MOCK_MAX_ALLOCATION: vk::DeviceSize = 1 << 30;

impl MockDevice {
    pub(crate) fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
            next_handle: Cell::new(1),
            resizable_bar: Cell::new(true),
            fence_waits_before_timeout: Cell::new(None),
            fail_next_fence_reset: Cell::new(false),
            fail_next_submit: Cell::new(false),
            work_in_flight: Cell::new(false),
            zero_size_queries: Cell::new(false),
            blas_bytes_per_primitive: Cell::new(64),
        }
    }

    fn next_raw(&self) -> u64 {
        let raw = self.next_handle.get();
        self.next_handle.set(raw + 1);
        raw
    }

    // ------------------------------------------------------------------
    // Knobs
    // ------------------------------------------------------------------

    /// Whether `CpuToGpu` memory is also device-local.
    pub(crate) fn set_resizable_bar(&self, enabled: bool) {
        self.resizable_bar.set(enabled);
    }

    /// Fail every buffer allocation whose name contains `pattern`.
    pub(crate) fn fail_buffers_named(&self, pattern: &str) {
        self.state.borrow_mut().failing_buffer_names.push(pattern.to_string());
    }

    pub(crate) fn fail_next_fence_wait(&self) {
        self.fail_fence_wait_after(0);
    }

    /// Let `waits` fence waits succeed, then time out the next one.
    pub(crate) fn fail_fence_wait_after(&self, waits: usize) {
        self.fence_waits_before_timeout.set(Some(waits));
    }

    pub(crate) fn fail_next_fence_reset(&self) {
        self.fail_next_fence_reset.set(true);
    }

    pub(crate) fn fail_next_submit(&self) {
        self.fail_next_submit.set(true);
    }

    /// Report zero sizes from every build size query.
    pub(crate) fn set_zero_size_queries(&self, enabled: bool) {
        self.zero_size_queries.set(enabled);
    }

    pub(crate) fn set_blas_bytes_per_primitive(&self, bytes: vk::DeviceSize) {
        self.blas_bytes_per_primitive.set(bytes);
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub(crate) fn allocated_command_buffers(&self) -> usize {
        self.state.borrow().allocated_command_buffers
    }

    pub(crate) fn submission_count(&self) -> usize {
        self.state.borrow().submissions.len()
    }

    pub(crate) fn submissions(&self) -> Vec<Vec<Command>> {
        self.state.borrow().submissions.clone()
    }

    pub(crate) fn last_submission(&self) -> Vec<Command> {
        self.state.borrow().submissions.last().cloned().unwrap_or_default()
    }

    /// Commands recorded into `cmd` since it last began.
    pub(crate) fn recorded(&self, cmd: vk::CommandBuffer) -> Vec<Command> {
        self.state.borrow().recordings.get(&cmd.as_raw()).cloned().unwrap_or_default()
    }

    pub(crate) fn live_buffers(&self) -> usize {
        self.state.borrow().buffers.len()
    }

    pub(crate) fn live_images(&self) -> usize {
        self.state.borrow().images.len()
    }

    pub(crate) fn live_command_pools(&self) -> usize {
        self.state.borrow().pools.len()
    }

    pub(crate) fn live_fences(&self) -> usize {
        self.state.borrow().fences.len()
    }

    pub(crate) fn live_query_pools(&self) -> usize {
        self.state.borrow().query_pools.len()
    }

    pub(crate) fn live_acceleration_structures(&self) -> usize {
        self.state.borrow().structures.len()
    }

    pub(crate) fn live_structures_of_type(&self, ty: vk::AccelerationStructureTypeKHR) -> usize {
        self.state.borrow().structures.values().filter(|s| s.ty == ty).count()
    }

    pub(crate) fn acceleration_structure_size(&self, handle: vk::AccelerationStructureKHR) -> Option<vk::DeviceSize> {
        self.state.borrow().structures.get(&handle.as_raw()).map(|s| s.size)
    }

    /// Destroy calls on handles the mock never issued or already destroyed.
    pub(crate) fn invalid_frees(&self) -> usize {
        self.state.borrow().invalid_frees
    }

    /// Resources destroyed while timed-out work
    /// may still be executing.
    pub(crate) fn in_flight_frees(&self) -> usize {
        self.state.borrow().in_flight_frees
    }

    pub(crate) fn idle_waits(&self) -> usize {
        self.state.borrow().idle_waits
    }

    pub(crate) fn buffer_contents(&self, buffer: vk::Buffer) -> Vec<u8> {
        self.state.borrow().buffers.get(&buffer.as_raw())
            .map(|memory| memory.iter().map(Cell::get).collect())
            .unwrap_or_default()
    }

    fn memory_properties(&self, location: MemoryLocation) -> vk::MemoryPropertyFlags {
        type P = vk::MemoryPropertyFlags;
        match location {
            MemoryLocation::GpuOnly => P::DEVICE_LOCAL,
            MemoryLocation::CpuToGpu if self.resizable_bar.get() => {
                P::DEVICE_LOCAL | P::HOST_VISIBLE | P::HOST_COHERENT
            }
            MemoryLocation::CpuToGpu => P::HOST_VISIBLE | P::HOST_COHERENT,
            MemoryLocation::GpuToCpu => P::HOST_VISIBLE | P::HOST_COHERENT | P::HOST_CACHED,
            MemoryLocation::Unknown => P::HOST_VISIBLE,
        }
    }

    fn execute(state: &mut State, commands: &[Command]) {
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, regions } => {
                    let (Some(src), Some(dst)) = (
                        state.buffers.get(&src.as_raw()).cloned(),
                        state.buffers.get(&dst.as_raw()).cloned(),
                    ) else {
                        continue;
                    };
                    for region in regions {
                        for i in 0..region.size as usize {
                            let byte = src[region.src_offset as usize + i].get();
                            dst[region.dst_offset as usize + i].set(byte);
                        }
                    }
                }
                Command::WriteCompactedSizes { structures, pool, first_query } => {
                    let sizes: Vec<vk::DeviceSize> = structures.iter()
                        .map(|s| {
                            let size = state.structures.get(&s.as_raw()).map_or(0, |s| s.size);
                            (size / 2).next_multiple_of(256).max(256)
                        })
                        .collect();
                    if let Some(results) = state.query_pools.get_mut(&pool.as_raw()) {
                        for (i, size) in sizes.into_iter().enumerate() {
                            results[*first_query as usize + i] = size;
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn note_destroy(&self, state: &mut State, known: bool) {
        if !known {
            state.invalid_frees += 1;
        }
        if self.work_in_flight.get() {
            state.in_flight_frees += 1;
        }
    }

    fn record(&self, cmd: vk::CommandBuffer, command: Command) {
        self.state.borrow_mut().recordings.entry(cmd.as_raw()).or_default().push(command);
    }
}

impl GpuDevice for MockDevice {
    type Allocation = MockAllocation;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<(vk::Buffer, MockAllocation)> {
        if size == 0 {
            return Err(GpuError::vulkan("create buffer", vk::Result::ERROR_VALIDATION_FAILED_EXT));
        }
        let fails = self.state.borrow().failing_buffer_names.iter().any(|p| name.contains(p.as_str()));
        if fails || size > MOCK_MAX_ALLOCATION {
            return Err(GpuError::vulkan("allocate memory", vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }

        let memory: Rc<[Cell<u8>]> = (0..size).map(|_| Cell::new(0)).collect();
        let buffer = vk::Buffer::from_raw(self.next_raw());
        self.state.borrow_mut().buffers.insert(buffer.as_raw(), Rc::clone(&memory));

        let allocation = MockAllocation {
            memory,
            properties: self.memory_properties(location),
        };
        Ok((buffer, allocation))
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, _allocation: MockAllocation) {
        let mut state = self.state.borrow_mut();
        let known = state.buffers.remove(&buffer.as_raw()).is_some();
        self.note_destroy(&mut state, known);
    }

    fn create_image(
        &self,
        _info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        _name: &str,
    ) -> GpuResult<(vk::Image, MockAllocation)> {
        let image = vk::Image::from_raw(self.next_raw());
        self.state.borrow_mut().images.insert(image.as_raw());
        let allocation = MockAllocation {
            memory: Rc::from(Vec::<Cell<u8>>::new()),
            properties: self.memory_properties(location),
        };
        Ok((image, allocation))
    }

    fn destroy_image(&self, image: vk::Image, _allocation: MockAllocation) {
        let mut state = self.state.borrow_mut();
        let known = state.images.remove(&image.as_raw());
        self.note_destroy(&mut state, known);
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        // Deliberately misaligned for scratch use.
        0x1_0000_0000 + buffer.as_raw() * 0x10_0000 + 64
    }

    fn create_command_pool(&self) -> GpuResult<vk::CommandPool> {
        let pool = vk::CommandPool::from_raw(self.next_raw());
        self.state.borrow_mut().pools.insert(pool.as_raw());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut state = self.state.borrow_mut();
        if !state.pools.remove(&pool.as_raw()) {
            state.invalid_frees += 1;
        }
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let cmd = vk::CommandBuffer::from_raw(self.next_raw());
        self.state.borrow_mut().allocated_command_buffers += 1;
        Ok(cmd)
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        self.state.borrow_mut().recordings.remove(&cmd.as_raw());
        Ok(())
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        self.state.borrow_mut().recordings.insert(cmd.as_raw(), Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _cmd: vk::CommandBuffer) -> GpuResult<()> {
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.record(cmd, Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(cmd, Command::CopyBufferToImage { src, dst, layout });
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        for _ in memory_barriers {
            self.record(cmd, Command::MemoryBarrier { src_stage, dst_stage });
        }
        for barrier in image_barriers {
            self.record(cmd, Command::ImageBarrier {
                image: barrier.image,
                old_layout: barrier.old_layout,
                new_layout: barrier.new_layout,
            });
        }
    }

    fn create_fence(&self) -> GpuResult<vk::Fence> {
        let fence = vk::Fence::from_raw(self.next_raw());
        self.state.borrow_mut().fences.insert(fence.as_raw());
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        if !state.fences.remove(&fence.as_raw()) {
            state.invalid_frees += 1;
        }
    }

    fn reset_fence(&self, _fence: vk::Fence) -> GpuResult<()> {
        if self.fail_next_fence_reset.replace(false) {
            return Err(GpuError::vulkan("reset fence", vk::Result::ERROR_DEVICE_LOST));
        }
        Ok(())
    }

    fn wait_for_fence(&self, _fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        match self.fence_waits_before_timeout.get() {
            Some(0) => {
                self.fence_waits_before_timeout.set(None);
                self.work_in_flight.set(true);
                Err(GpuError::FenceTimeout(timeout_ns))
            }
            Some(n) => {
                self.fence_waits_before_timeout.set(Some(n - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn queue_submit(&self, cmd: vk::CommandBuffer, _fence: vk::Fence) -> GpuResult<()> {
        if self.fail_next_submit.replace(false) {
            return Err(GpuError::vulkan("queue submit", vk::Result::ERROR_DEVICE_LOST));
        }
        let mut state = self.state.borrow_mut();
        let commands = state.recordings.get(&cmd.as_raw()).cloned().unwrap_or_default();
        Self::execute(&mut state, &commands);
        state.submissions.push(commands);
        Ok(())
    }

    fn queue_wait_idle(&self) -> GpuResult<()> {
        self.work_in_flight.set(false);
        self.state.borrow_mut().idle_waits += 1;
        Ok(())
    }

    fn min_scratch_offset_alignment(&self) -> vk::DeviceSize {
        MOCK_SCRATCH_ALIGNMENT
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> GpuResult<vk::AccelerationStructureBuildSizesInfoKHR<'static>> {
        if self.zero_size_queries.get() {
            return Ok(vk::AccelerationStructureBuildSizesInfoKHR::default());
        }
        let count: vk::DeviceSize = max_primitive_counts.iter().map(|&c| c as vk::DeviceSize).sum();
        let (size, scratch, update) = if info.ty == vk::AccelerationStructureTypeKHR::TOP_LEVEL {
            (1024 + count * 128, 512 + count * 64, 256 + count * 16)
        } else {
            (1024 + count * self.blas_bytes_per_primitive.get(), 512 + count * 32, 256 + count * 8)
        };
        Ok(vk::AccelerationStructureBuildSizesInfoKHR::default()
            .acceleration_structure_size(size)
            .build_scratch_size(scratch)
            .update_scratch_size(update))
    }

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> GpuResult<vk::AccelerationStructureKHR> {
        let handle = vk::AccelerationStructureKHR::from_raw(self.next_raw());
        self.state.borrow_mut().structures.insert(handle.as_raw(), MockStructure {
            size: info.size,
            ty: info.ty,
        });
        Ok(handle)
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        let mut state = self.state.borrow_mut();
        let known = state.structures.remove(&handle.as_raw()).is_some();
        self.note_destroy(&mut state, known);
    }

    fn acceleration_structure_device_address(&self, handle: vk::AccelerationStructureKHR) -> vk::DeviceAddress {
        0xA000_0000_0000 + handle.as_raw() * 0x100
    }

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        for (info, ranges) in infos.iter().zip(ranges) {
            // SAFETY: device builds always set the device-address member.
            let scratch_address = unsafe { info.scratch_data.device_address };
            self.record(cmd, Command::BuildAccelerationStructure {
                ty: info.ty,
                mode: info.mode,
                flags: info.flags,
                src: info.src_acceleration_structure,
                dst: info.dst_acceleration_structure,
                scratch_address,
                geometry_count: info.geometry_count,
                primitive_count: ranges.iter().map(|r| r.primitive_count).sum(),
            });
        }
    }

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        self.record(cmd, Command::CopyAccelerationStructure {
            src: info.src,
            dst: info.dst,
            mode: info.mode,
        });
    }

    fn create_compaction_query_pool(&self, count: u32) -> GpuResult<vk::QueryPool> {
        let pool = vk::QueryPool::from_raw(self.next_raw());
        self.state.borrow_mut().query_pools.insert(pool.as_raw(), vec![0; count as usize]);
        Ok(pool)
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        let mut state = self.state.borrow_mut();
        let known = state.query_pools.remove(&pool.as_raw()).is_some();
        self.note_destroy(&mut state, known);
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        self.record(cmd, Command::ResetQueryPool { pool, first, count });
    }

    fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first_query: u32,
    ) {
        self.record(cmd, Command::WriteCompactedSizes {
            structures: structures.to_vec(),
            pool,
            first_query,
        });
    }

    fn compacted_sizes(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Vec<vk::DeviceSize>> {
        self.state.borrow().query_pools.get(&pool.as_raw())
            .map(|results| results[..count as usize].to_vec())
            .ok_or(GpuError::vulkan("get query pool results", vk::Result::ERROR_UNKNOWN))
    }
}
