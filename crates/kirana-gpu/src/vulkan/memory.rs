//! GPU memory management: buffers and images under an explicit allocation
//! policy, with staged uploads hidden behind the policy.
//!
//! The allocator owns one [`CommandSubmissionPool`] for its own transfers and
//! blocks on every copy it submits.

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use gpu_allocator::MemoryLocation;
use log::{debug, error, warn};
use std::cell::RefCell;
use std::fmt;
use std::ptr::NonNull;

use super::commands::CommandSubmissionPool;
use super::device::{DeviceAllocation, GpuDevice};
use super::error::{GpuError, GpuResult};

/// How a buffer or image is placed in memory and how host data reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationPolicy {
    /// Device-local; host data only arrives through a staged upload.
    GpuReadOnly,
    /// Device-local, always filled through a temporary host-visible buffer.
    GpuWriteable,
    /// Host-visible and device-local if available, otherwise staged.
    Writeable,
    /// Host-visible memory suited to cached device→host reads.
    ReadBack,
}

impl AllocationPolicy {
    /// Memory location first requested from the allocator.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            AllocationPolicy::GpuReadOnly | AllocationPolicy::GpuWriteable => MemoryLocation::GpuOnly,
            AllocationPolicy::Writeable => MemoryLocation::CpuToGpu,
            AllocationPolicy::ReadBack => MemoryLocation::GpuToCpu,
        }
    }
}

/// GPU buffer with associated memory.
pub struct AllocatedBuffer<A = Allocation> {
    pub handle: vk::Buffer,
    pub allocation: Option<A>,
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    pub policy: AllocationPolicy,
    pub device_address: Option<vk::DeviceAddress>,
    mapped: Option<NonNull<u8>>,
    name: String,
}

impl<A> Default for AllocatedBuffer<A> {
    fn default() -> Self {
        Self {
            handle: vk::Buffer::null(),
            allocation: None,
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            policy: AllocationPolicy::GpuReadOnly,
            device_address: None,
            mapped: None,
            name: String::new(),
        }
    }
}

impl<A> AllocatedBuffer<A> {
    /// Whether the buffer still owns device memory.
    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }

    /// Host pointer, once the buffer has been mapped by a copy.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> GpuResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(GpuError::OutOfBounds {
                name: self.name.clone(),
                offset,
                len,
                capacity: self.size,
            }),
        }
    }
}

impl<A> fmt::Debug for AllocatedBuffer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedBuffer")
            .field("name", &self.name)
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .field("policy", &self.policy)
            .field("device_address", &self.device_address)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

impl<A: DeviceAllocation> AllocatedBuffer<A> {
    /// Map on first use; fails if the memory type is not host-visible.
    fn map(&mut self) -> GpuResult<NonNull<u8>> {
        if let Some(ptr) = self.mapped {
            return Ok(ptr);
        }
        let ptr = self.allocation.as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| GpuError::MapFailed(self.name.clone()))?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }
}

/// GPU image with associated memory.
pub struct AllocatedImage<A = Allocation> {
    pub handle: vk::Image,
    pub allocation: Option<A>,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub layout: vk::ImageLayout,
    pub policy: AllocationPolicy,
}

impl<A> Default for AllocatedImage<A> {
    fn default() -> Self {
        Self {
            handle: vk::Image::null(),
            allocation: None,
            format: vk::Format::UNDEFINED,
            extent: vk::Extent3D::default(),
            mip_levels: 0,
            array_layers: 0,
            layout: vk::ImageLayout::UNDEFINED,
            policy: AllocationPolicy::GpuReadOnly,
        }
    }
}

impl<A> AllocatedImage<A> {
    pub fn is_allocated(&self) -> bool {
        self.allocation.is_some()
    }
}

impl<A> fmt::Debug for AllocatedImage<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatedImage")
            .field("handle", &self.handle)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("mip_levels", &self.mip_levels)
            .field("array_layers", &self.array_layers)
            .field("layout", &self.layout)
            .field("policy", &self.policy)
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// Memory whose release waits until the queue is idle.
enum Retired<A> {
    Buffer(vk::Buffer, A),
    Image(vk::Image, A),
}

/// Bytes a tightly packed copy of `extent` over `layers` layers reads.
///
/// `None` for block-compressed or unknown formats.
fn packed_image_size(format: vk::Format, extent: vk::Extent3D, layers: u32) -> Option<vk::DeviceSize> {
    let texel: vk::DeviceSize = match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT | vk::Format::R8_SRGB => 1,
        vk::Format::R8G8_UNORM | vk::Format::R16_SFLOAT | vk::Format::R16_UINT | vk::Format::D16_UNORM => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32
        | vk::Format::D32_SFLOAT => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => return None,
    };
    Some(texel * extent.width as u64 * extent.height as u64 * extent.depth as u64 * layers as u64)
}

/// Buffer and image allocator over a [`GpuDevice`].
pub struct MemoryAllocator<'d, D: GpuDevice> {
    device: &'d D,
    commands: CommandSubmissionPool<'d, D>,
    /// Staging and destination memory of timed-out transfers.
    retired: RefCell<Vec<Retired<D::Allocation>>>,
}

impl<'d, D: GpuDevice> MemoryAllocator<'d, D> {
    /// Create the allocator and its internal transfer pool.
    pub fn new(device: &'d D, fence_timeout_ns: u64) -> GpuResult<Self> {
        let commands = CommandSubmissionPool::new(device, fence_timeout_ns)?;
        Ok(Self {
            device,
            commands,
            retired: RefCell::new(Vec::new()),
        })
    }

    pub fn device(&self) -> &'d D {
        self.device
    }

    /// Allocations held back until the queue drains.
    pub fn deferred_releases(&self) -> usize {
        self.retired.borrow().len()
    }

    /// Allocate a buffer under `policy`, optionally filled with `initial_data`.
    ///
    /// `initial_data` may be shorter than `size`; the remainder is zeroed on
    /// staged paths.
    pub fn allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        policy: AllocationPolicy,
        initial_data: Option<&[u8]>,
        name: &str,
    ) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        self.try_allocate_buffer(size, usage, policy, initial_data, name)
            .inspect_err(|e| error!("Buffer allocation '{}' ({:?}) failed: {}", name, policy, e))
    }

    fn try_allocate_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        policy: AllocationPolicy,
        initial_data: Option<&[u8]>,
        name: &str,
    ) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        if size == 0 {
            return Err(GpuError::allocation(name, "zero-sized buffer"));
        }
        if let Some(data) = initial_data {
            if data.len() as vk::DeviceSize > size {
                return Err(GpuError::OutOfBounds {
                    name: name.to_string(),
                    offset: 0,
                    len: data.len() as vk::DeviceSize,
                    capacity: size,
                });
            }
        }

        let buffer = match policy {
            AllocationPolicy::GpuReadOnly => match initial_data {
                Some(data) => self.create_staged(size, usage, policy, data, name)?,
                None => self.create_direct(size, usage, MemoryLocation::GpuOnly, policy, name)?,
            },
            AllocationPolicy::GpuWriteable => {
                self.create_staged(size, usage, policy, initial_data.unwrap_or(&[]), name)?
            }
            AllocationPolicy::Writeable => match self.create_host_device_local(size, usage, name) {
                Ok(mut buffer) => {
                    if let Some(data) = initial_data {
                        if let Err(e) = self.write_mapped(&mut buffer, data, 0) {
                            self.free_buffer(&mut buffer);
                            return Err(e);
                        }
                    }
                    buffer
                }
                Err(e) => {
                    warn!("'{}': no host-visible device-local memory ({}), staging instead", name, e);
                    self.create_staged(size, usage, policy, initial_data.unwrap_or(&[]), name)?
                }
            },
            AllocationPolicy::ReadBack => {
                let mut buffer = self.create_direct(size, usage, MemoryLocation::GpuToCpu, policy, name)?;
                if let Some(data) = initial_data {
                    if let Err(e) = self.write_mapped(&mut buffer, data, 0) {
                        self.free_buffer(&mut buffer);
                        return Err(e);
                    }
                }
                buffer
            }
        };

        debug!("Allocated buffer '{}' ({} bytes, {:?})", name, size, policy);
        Ok(buffer)
    }

    /// Create a buffer directly in `location`, without any transfer.
    fn create_direct(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        policy: AllocationPolicy,
        name: &str,
    ) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        let (handle, allocation) = self.device.create_buffer(size, usage, location, name)?;

        // Get device address if usage includes it
        let device_address = if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            Some(self.device.buffer_device_address(handle))
        } else {
            None
        };

        Ok(AllocatedBuffer {
            handle,
            allocation: Some(allocation),
            size,
            usage,
            policy,
            device_address,
            mapped: None,
            name: name.to_string(),
        })
    }

    /// Host-visible memory that is also device-local, or an error.
    fn create_host_device_local(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        name: &str,
    ) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        let mut buffer = self.create_direct(size, usage, MemoryLocation::CpuToGpu, AllocationPolicy::Writeable, name)?;

        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let properties = buffer.allocation.as_ref()
            .map(|a| a.memory_properties())
            .unwrap_or_default();

        if !properties.contains(wanted) {
            self.free_buffer(&mut buffer);
            return Err(GpuError::allocation(name, format!("memory type {:?} is not device-local", properties)));
        }
        Ok(buffer)
    }

    /// Upload through a temporary host-visible buffer into device-local memory.
    fn create_staged(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        policy: AllocationPolicy,
        data: &[u8],
        name: &str,
    ) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        let staging_name = format!("{} (staging)", name);
        let mut staging = self.create_direct(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            AllocationPolicy::Writeable,
            &staging_name,
        )?;

        let result = self.fill_staging(&mut staging, data)
            .and_then(|()| {
                let mut dst = self.create_direct(
                    size,
                    usage | vk::BufferUsageFlags::TRANSFER_DST,
                    MemoryLocation::GpuOnly,
                    policy,
                    name,
                )?;
                match self.copy_buffer(&staging, &dst, size, 0, 0) {
                    Ok(()) => Ok(dst),
                    Err(e) => {
                        self.release_buffer(&mut dst);
                        Err(e)
                    }
                }
            });

        self.release_buffer(&mut staging);
        result
    }

    /// Copy `data` to the start of a staging buffer and zero the remainder.
    fn fill_staging(&self, staging: &mut AllocatedBuffer<D::Allocation>, data: &[u8]) -> GpuResult<()> {
        let ptr = staging.map()?;
        let size = staging.size as usize;
        // SAFETY: the mapping covers `size` bytes and `data.len() <= size`.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr(), data.len());
            std::ptr::write_bytes(ptr.as_ptr().add(data.len()), 0, size - data.len());
        }
        Ok(())
    }

    fn write_mapped(
        &self,
        buffer: &mut AllocatedBuffer<D::Allocation>,
        data: &[u8],
        offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        buffer.check_range(offset, data.len() as vk::DeviceSize)?;
        let ptr = buffer.map()?;
        // SAFETY: the range was checked against the buffer size and the
        // mapping covers the whole buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Write `data` into a host-visible buffer at `offset`, mapping it if needed.
    ///
    /// Fails without touching memory if the buffer cannot be mapped or the
    /// range does not fit.
    pub fn copy_data_to_buffer(
        &self,
        buffer: &mut AllocatedBuffer<D::Allocation>,
        data: &[u8],
        offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        self.write_mapped(buffer, data, offset)
            .inspect_err(|e| error!("Copy into '{}' failed: {}", buffer.name, e))
    }

    /// Read `out.len()` bytes from a host-visible buffer at `offset`.
    pub fn copy_data_from_buffer(
        &self,
        buffer: &mut AllocatedBuffer<D::Allocation>,
        offset: vk::DeviceSize,
        out: &mut [u8],
    ) -> GpuResult<()> {
        let result = buffer.check_range(offset, out.len() as vk::DeviceSize)
            .and_then(|()| buffer.map());
        match result {
            Ok(ptr) => {
                // SAFETY: range checked above; the mapping covers the buffer.
                unsafe {
                    std::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset as usize), out.as_mut_ptr(), out.len());
                }
                Ok(())
            }
            Err(e) => {
                error!("Read from '{}' failed: {}", buffer.name, e);
                Err(e)
            }
        }
    }

    /// Copy `size` bytes between buffers on the GPU and wait for completion.
    pub fn copy_buffer(
        &self,
        src: &AllocatedBuffer<D::Allocation>,
        dst: &AllocatedBuffer<D::Allocation>,
        size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        self.try_copy_buffer(src, dst, size, src_offset, dst_offset)
            .inspect_err(|e| error!("Copy '{}' -> '{}' failed: {}", src.name, dst.name, e))
    }

    fn try_copy_buffer(
        &self,
        src: &AllocatedBuffer<D::Allocation>,
        dst: &AllocatedBuffer<D::Allocation>,
        size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        if !src.is_allocated() || !dst.is_allocated() {
            return Err(GpuError::allocation(
                if src.is_allocated() { &dst.name } else { &src.name },
                "buffer was never allocated or already freed",
            ));
        }
        src.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        if size == 0 {
            return Ok(());
        }

        let cmd = self.commands.begin()?;
        let region = vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };
        self.device.cmd_copy_buffer(cmd, src.handle, dst.handle, &[region]);
        self.commands.submit_and_wait(cmd)
    }

    /// Create an image under `policy` and transition it from `UNDEFINED` to
    /// `layout` on a one-shot command buffer, uploading `initial_data` to
    /// the base mip level on the way if given.
    pub fn allocate_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
        policy: AllocationPolicy,
        initial_data: Option<&[u8]>,
        name: &str,
    ) -> GpuResult<AllocatedImage<D::Allocation>> {
        self.try_allocate_image(info, layout, subresource_range, policy, initial_data, name)
            .inspect_err(|e| error!("Image allocation '{}' ({:?}) failed: {}", name, policy, e))
    }

    fn try_allocate_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        layout: vk::ImageLayout,
        subresource_range: vk::ImageSubresourceRange,
        policy: AllocationPolicy,
        initial_data: Option<&[u8]>,
        name: &str,
    ) -> GpuResult<AllocatedImage<D::Allocation>> {
        let extent = info.extent;
        if extent.width == 0 || extent.height == 0 || extent.depth == 0 {
            return Err(GpuError::allocation(name, "zero-sized image"));
        }
        if let Some(data) = initial_data {
            let layers = copy_layer_count(subresource_range, info.array_layers);
            let needed = packed_image_size(info.format, extent, layers).unwrap_or(1);
            if (data.len() as vk::DeviceSize) < needed {
                return Err(GpuError::OutOfBounds {
                    name: name.to_string(),
                    offset: 0,
                    len: needed,
                    capacity: data.len() as vk::DeviceSize,
                });
            }
        }

        let mut create_info = *info;
        create_info.initial_layout = vk::ImageLayout::UNDEFINED;
        if initial_data.is_some() {
            create_info.usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let created = self.device.create_image(&create_info, policy.memory_location(), name);
        let (handle, allocation) = match (policy, created) {
            (AllocationPolicy::Writeable, Err(e)) => {
                warn!("'{}': host-visible image memory unavailable ({}), using device-local", name, e);
                self.device.create_image(&create_info, MemoryLocation::GpuOnly, name)?
            }
            (_, created) => created?,
        };

        let mut image = AllocatedImage {
            handle,
            allocation: Some(allocation),
            format: create_info.format,
            extent,
            mip_levels: create_info.mip_levels,
            array_layers: create_info.array_layers,
            layout: vk::ImageLayout::UNDEFINED,
            policy,
        };

        let mut staging = match initial_data {
            Some(data) => match self.create_upload_source(data, name) {
                Ok(staging) => Some(staging),
                Err(e) => {
                    self.free_image(&mut image);
                    return Err(e);
                }
            },
            None => None,
        };

        let result = self.record_initial_transition(&image, staging.as_ref(), layout, subresource_range);

        if let Some(staging) = staging.as_mut() {
            self.release_buffer(staging);
        }

        match result {
            Ok(()) => {
                image.layout = layout;
                debug!("Allocated image '{}' ({}x{}x{}, {:?})", name, extent.width, extent.height, extent.depth, policy);
                Ok(image)
            }
            Err(e) => {
                self.release_image(&mut image);
                Err(e)
            }
        }
    }

    fn create_upload_source(&self, data: &[u8], name: &str) -> GpuResult<AllocatedBuffer<D::Allocation>> {
        let staging_name = format!("{} (staging)", name);
        let mut staging = self.create_direct(
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            AllocationPolicy::Writeable,
            &staging_name,
        )?;
        if let Err(e) = self.fill_staging(&mut staging, data) {
            self.free_buffer(&mut staging);
            return Err(e);
        }
        Ok(staging)
    }

    fn record_initial_transition(
        &self,
        image: &AllocatedImage<D::Allocation>,
        staging: Option<&AllocatedBuffer<D::Allocation>>,
        layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
    ) -> GpuResult<()> {
        let cmd = self.commands.begin()?;

        match staging {
            Some(staging) => {
                self.commands.transition_image_layout(
                    cmd,
                    image.handle,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    range,
                );

                let layer_count = copy_layer_count(range, image.array_layers);
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(0)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: range.aspect_mask,
                        mip_level: range.base_mip_level,
                        base_array_layer: range.base_array_layer,
                        layer_count,
                    })
                    .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                    .image_extent(image.extent);

                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle,
                    image.handle,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );

                if layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
                    self.commands.transition_image_layout(
                        cmd,
                        image.handle,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        layout,
                        range,
                    );
                }
            }
            // A transition to UNDEFINED is not a valid barrier.
            None if layout != vk::ImageLayout::UNDEFINED => {
                self.commands.transition_image_layout(cmd, image.handle, vk::ImageLayout::UNDEFINED, layout, range);
            }
            None => {}
        }

        self.commands.submit_and_wait(cmd)
    }

    /// Release a buffer's memory. Freeing a default or already-freed buffer is a no-op.
    pub fn free_buffer(&self, buffer: &mut AllocatedBuffer<D::Allocation>) {
        buffer.mapped = None;
        buffer.device_address = None;
        if let Some(allocation) = buffer.allocation.take() {
            self.device.destroy_buffer(buffer.handle, allocation);
            debug!("Freed buffer '{}'", buffer.name);
        }
        buffer.handle = vk::Buffer::null();
    }

    /// Free `buffer`, or hold it until the queue drains if a transfer timed out.
    fn release_buffer(&self, buffer: &mut AllocatedBuffer<D::Allocation>) {
        if !self.commands.is_lost() {
            self.free_buffer(buffer);
            return;
        }
        buffer.mapped = None;
        buffer.device_address = None;
        if let Some(allocation) = buffer.allocation.take() {
            debug!("Deferring release of buffer '{}'", buffer.name);
            self.retired.borrow_mut().push(Retired::Buffer(buffer.handle, allocation));
        }
        buffer.handle = vk::Buffer::null();
    }

    fn release_image(&self, image: &mut AllocatedImage<D::Allocation>) {
        if !self.commands.is_lost() {
            self.free_image(image);
            return;
        }
        if let Some(allocation) = image.allocation.take() {
            self.retired.borrow_mut().push(Retired::Image(image.handle, allocation));
        }
        image.handle = vk::Image::null();
        image.layout = vk::ImageLayout::UNDEFINED;
    }

    /// Release an image's memory. Freeing a default or already-freed image is a no-op.
    pub fn free_image(&self, image: &mut AllocatedImage<D::Allocation>) {
        if let Some(allocation) = image.allocation.take() {
            self.device.destroy_image(image.handle, allocation);
        }
        image.handle = vk::Image::null();
        image.layout = vk::ImageLayout::UNDEFINED;
    }
}

impl<D: GpuDevice> Drop for MemoryAllocator<'_, D> {
    fn drop(&mut self) {
        let retired = std::mem::take(self.retired.get_mut());
        if retired.is_empty() {
            return;
        }
        if let Err(e) = self.device.queue_wait_idle() {
            error!("Queue wait before releasing {} deferred allocations failed: {}", retired.len(), e);
        }
        for entry in retired {
            match entry {
                Retired::Buffer(handle, allocation) => self.device.destroy_buffer(handle, allocation),
                Retired::Image(handle, allocation) => self.device.destroy_image(handle, allocation),
            }
        }
        debug!("Deferred allocations released");
    }
}

/// Layers covered by a copy into `range` of an image with `array_layers` layers.
fn copy_layer_count(range: vk::ImageSubresourceRange, array_layers: u32) -> u32 {
    if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
        array_layers.saturating_sub(range.base_array_layer)
    } else {
        range.layer_count
    }
}
