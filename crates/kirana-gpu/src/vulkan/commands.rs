//! Command buffer recycling and fence-gated submission.
//!
//! Every submission blocks on the pool's fence with a bounded timeout before
//! the command buffer is handed back for reuse. A timeout leaves the pool
//! unusable: the buffer may still be executing, so neither it nor the fence
//! can be recycled.

use ash::vk;
use log::{debug, error};
use std::cell::{Cell, RefCell};

use super::device::GpuDevice;
use super::error::{GpuError, GpuResult};

/// One command pool plus a dedicated fence for transfer and build work.
///
/// Not `Sync`: the pool is driven from a single resource-loading thread.
pub struct CommandSubmissionPool<'d, D: GpuDevice> {
    device: &'d D,
    pool: vk::CommandPool,
    fence: vk::Fence,
    idle: RefCell<Vec<vk::CommandBuffer>>,
    timeout_ns: u64,
    lost: Cell<bool>,
}

impl<'d, D: GpuDevice> CommandSubmissionPool<'d, D> {
    /// Create the pool and its fence.
    pub fn new(device: &'d D, timeout_ns: u64) -> GpuResult<Self> {
        let pool = device.create_command_pool()?;
        let fence = match device.create_fence() {
            Ok(fence) => fence,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };

        debug!("Command submission pool created");

        Ok(Self {
            device,
            pool,
            fence,
            idle: RefCell::new(Vec::new()),
            timeout_ns,
            lost: Cell::new(false),
        })
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    pub fn timeout_ns(&self) -> u64 {
        self.timeout_ns
    }

    /// Whether an earlier fence wait timed out.
    pub fn is_lost(&self) -> bool {
        self.lost.get()
    }

    /// Number of recorded-and-retired command buffers waiting for reuse.
    pub fn idle_count(&self) -> usize {
        self.idle.borrow().len()
    }

    /// Take a recycled command buffer (or allocate one) and begin recording.
    pub fn begin(&self) -> GpuResult<vk::CommandBuffer> {
        if self.lost.get() {
            return Err(GpuError::SubmissionLost);
        }

        let recycled = self.idle.borrow_mut().pop();
        let cmd = match recycled {
            Some(cmd) => cmd,
            None => self.device.allocate_command_buffer(self.pool)?,
        };

        if let Err(e) = self.device.begin_command_buffer(cmd) {
            self.recycle(cmd);
            return Err(e);
        }
        Ok(cmd)
    }

    /// End recording, submit, and block until the fence signals.
    pub fn submit_and_wait(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        if self.lost.get() {
            return Err(GpuError::SubmissionLost);
        }

        if let Err(e) = self.device.end_command_buffer(cmd)
            .and_then(|()| self.device.queue_submit(cmd, self.fence))
        {
            self.recycle(cmd);
            return Err(e);
        }

        match self.device.wait_for_fence(self.fence, self.timeout_ns) {
            Ok(()) => {}
            Err(e @ GpuError::FenceTimeout(_)) => {
                error!("Submission did not complete within {} ns", self.timeout_ns);
                self.lost.set(true);
                return Err(e);
            }
            Err(e) => {
                self.lost.set(true);
                return Err(e);
            }
        }

        if let Err(e) = self.device.reset_fence(self.fence) {
            // A fence left signaled would let the next wait return early.
            self.lost.set(true);
            return Err(e);
        }
        self.recycle(cmd);
        Ok(())
    }

    /// Drop a recording that will not be submitted.
    pub fn discard(&self, cmd: vk::CommandBuffer) {
        if let Err(e) = self.device.end_command_buffer(cmd) {
            debug!("Ending discarded command buffer failed: {}", e);
        }
        self.recycle(cmd);
    }

    fn recycle(&self, cmd: vk::CommandBuffer) {
        match self.device.reset_command_buffer(cmd) {
            Ok(()) => self.idle.borrow_mut().push(cmd),
            // Left to the pool; destroying it frees the buffer.
            Err(e) => debug!("Command buffer not recycled: {}", e),
        }
    }

    /// Record an image layout transition.
    pub fn transition_image_layout(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old_layout, new_layout);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(subresource_range)
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(cmd, src_stage, dst_stage, &[], &[barrier]);
    }

    /// Order acceleration-structure writes before later builds read them.
    pub fn acceleration_structure_barrier(&self, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR
                    | vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
            );

        self.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            &[barrier],
            &[],
        );
    }
}

impl<D: GpuDevice> Drop for CommandSubmissionPool<'_, D> {
    fn drop(&mut self) {
        // Command buffers of a timed-out submission may still be executing.
        if self.lost.get() {
            if let Err(e) = self.device.queue_wait_idle() {
                error!("Queue wait before pool teardown failed: {}", e);
            }
        }
        self.device.destroy_fence(self.fence);
        self.device.destroy_command_pool(self.pool);
        debug!("Command submission pool destroyed");
    }
}

/// Access masks and pipeline stages for a layout transition.
fn transition_masks(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    match (old_layout, new_layout) {
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::TRANSFER_DST_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        // Storage images written by ray generation shaders.
        (vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL) => (
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        (vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::GENERAL) => (
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    }
}
