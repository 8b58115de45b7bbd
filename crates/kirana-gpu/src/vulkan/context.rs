//! Vulkan device: instance, physical device, logical device, transfer queue
//! and memory allocator. Implements [`GpuDevice`] over `ash` and `gpu-allocator`.

use ash::khr::{acceleration_structure, deferred_host_operations};
use ash::{vk, Device, Entry, Instance};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::os::raw::c_char;

use super::device::GpuDevice;
use super::error::{GpuError, GpuResult};
use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

/// Ray tracing capabilities of the selected physical device.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    pub supported: bool,
    pub max_geometry_count: u64,
    pub max_instance_count: u64,
    pub max_primitive_count: u64,
    pub min_scratch_offset_alignment: u32,
}

/// Headless Vulkan device used for resource loading and acceleration structure builds.
pub struct VulkanDevice {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_family: u32,
    pub queue: vk::Queue,
    pub accel_struct_loader: acceleration_structure::Device,
    pub rt_capabilities: RtCapabilities,
    pub device_properties: vk::PhysicalDeviceProperties,

    // Dropped explicitly before the logical device is destroyed.
    allocator: ManuallyDrop<Mutex<Allocator>>,

    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl VulkanDevice {
    /// Load Vulkan and create a device with acceleration-structure support.
    ///
    /// # Arguments
    /// * `enable_validation` - Whether to enable the Khronos validation layer
    pub fn new(enable_validation: bool) -> GpuResult<Self> {
        // SAFETY: the loaded library stays alive inside `Entry` for the
        // lifetime of the device.
        let entry = unsafe { Entry::load() }
            .map_err(|e| GpuError::Init(format!("failed to load Vulkan: {}", e)))?;

        unsafe { Self::with_entry(entry, enable_validation) }
    }

    unsafe fn with_entry(entry: Entry, enable_validation: bool) -> GpuResult<Self> {
        let api_version = match entry.try_enumerate_instance_version()
            .map_err(|e| GpuError::vulkan("enumerate instance version", e))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(GpuError::Init(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, enable_validation)?;

        let (debug_utils_loader, debug_messenger) = if enable_validation {
            match Self::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => messenger,
                Err(e) => {
                    instance.destroy_instance(None);
                    return Err(e);
                }
            }
        } else {
            (None, None)
        };

        // Tears down the instance-level objects when a later step fails.
        let abandon = |e: GpuError| {
            if let (Some(loader), Some(messenger)) = (&debug_utils_loader, debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
            e
        };

        let (physical_device, queue_family, rt_capabilities) =
            Self::pick_physical_device(&instance).map_err(abandon)?;
        let device_properties = instance.get_physical_device_properties(physical_device);

        let (device, queue) =
            Self::create_logical_device(&instance, physical_device, queue_family).map_err(abandon)?;
        let accel_struct_loader = acceleration_structure::Device::new(&instance, &device);

        let mut debug_settings = gpu_allocator::AllocatorDebugSettings::default();
        debug_settings.log_memory_information = cfg!(debug_assertions);
        debug_settings.log_leaks_on_shutdown = true;

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings,
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                device.destroy_device(None);
                return Err(abandon(GpuError::Init(format!("failed to create allocator: {}", e))));
            }
        };

        debug!("Vulkan device created (queue family {})", queue_family);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_family,
            queue,
            accel_struct_loader,
            rt_capabilities,
            device_properties,
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            debug_utils_loader,
            debug_messenger,
        })
    }

    /// Create a Vulkan instance without surface extensions.
    unsafe fn create_instance(entry: &Entry, enable_validation: bool) -> GpuResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions: Vec<*const c_char> = Vec::new();
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter()
            .map(|n| n.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry.create_instance(&create_info, None)
            .map_err(|e| GpuError::vulkan("create instance", e))
    }

    /// Route validation messages through the `log` facade.
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> GpuResult<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(|e| GpuError::vulkan("create debug messenger", e))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    /// Select the best physical device that can build acceleration structures.
    unsafe fn pick_physical_device(
        instance: &Instance,
    ) -> GpuResult<(vk::PhysicalDevice, u32, RtCapabilities)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(|e| GpuError::vulkan("enumerate physical devices", e))?;

        if devices.is_empty() {
            return Err(GpuError::Init("no Vulkan-capable GPU found".to_string()));
        }

        let mut scored_devices: Vec<_> = devices.iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device);
                if score > 0 {
                    Some((device, score))
                } else {
                    None
                }
            })
            .collect();

        scored_devices.sort_by(|a, b| b.1.cmp(&a.1));

        let Some(&(physical_device, _)) = scored_devices.first() else {
            return Err(GpuError::RayTracingUnsupported(
                "no GPU exposes VK_KHR_acceleration_structure with a compute queue".to_string(),
            ));
        };

        let queue_family = Self::find_queue_family(instance, physical_device)
            .ok_or_else(|| GpuError::Init("selected GPU has no compute queue".to_string()))?;
        let rt_caps = Self::check_rt_support(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        info!("Selected GPU: {} (scratch alignment {})", name, rt_caps.min_scratch_offset_alignment);

        Ok((physical_device, queue_family, rt_caps))
    }

    /// Rate a physical device (higher is better, zero is unusable).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u64 {
        let props = instance.get_physical_device_properties(device);

        if Self::find_queue_family(instance, device).is_none() {
            return 0;
        }
        if !Self::check_rt_support(instance, device).supported {
            return 0;
        }

        let mut score = 1u64;

        // Prefer discrete GPU
        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // Add VRAM size to score
        let memory_props = instance.get_physical_device_memory_properties(device);
        for heap in &memory_props.memory_heaps[..memory_props.memory_heap_count as usize] {
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += heap.size / (1024 * 1024);
            }
        }

        score
    }

    /// First queue family that supports both graphics and compute work.
    unsafe fn find_queue_family(instance: &Instance, device: vk::PhysicalDevice) -> Option<u32> {
        instance.get_physical_device_queue_family_properties(device)
            .iter()
            .position(|family| {
                family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|i| i as u32)
    }

    /// Check acceleration structure support on a physical device.
    unsafe fn check_rt_support(instance: &Instance, device: vk::PhysicalDevice) -> RtCapabilities {
        let extensions = match instance.enumerate_device_extension_properties(device) {
            Ok(ext) => ext,
            Err(_) => return RtCapabilities::default(),
        };

        let has_extension = |wanted: &CStr| {
            extensions.iter().any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == wanted)
        };

        if !has_extension(acceleration_structure::NAME) || !has_extension(deferred_host_operations::NAME) {
            return RtCapabilities::default();
        }

        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut props2 = vk::PhysicalDeviceProperties2::default()
            .push_next(&mut as_props);
        instance.get_physical_device_properties2(device, &mut props2);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut vulkan_12_features);
        instance.get_physical_device_features2(device, &mut features2);

        RtCapabilities {
            supported: accel_features.acceleration_structure == vk::TRUE &&
                       vulkan_12_features.buffer_device_address == vk::TRUE,
            max_geometry_count: as_props.max_geometry_count,
            max_instance_count: as_props.max_instance_count,
            max_primitive_count: as_props.max_primitive_count,
            min_scratch_offset_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
        }
    }

    /// Create the logical device with buffer device address and acceleration structures enabled.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> GpuResult<(Device, vk::Queue)> {
        let queue_priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family)
            .queue_priorities(&queue_priorities)];

        let extensions: Vec<*const c_char> = vec![
            acceleration_structure::NAME.as_ptr(),
            deferred_host_operations::NAME.as_ptr(),
        ];

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(true);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features)
            .push_next(&mut accel_features);

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance.create_device(physical_device, &create_info, None)
            .map_err(|e| GpuError::vulkan("create logical device", e))?;

        let queue = device.get_device_queue(queue_family, 0);

        Ok((device, queue))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed: {:?}", e);
            }
        }
    }
}

impl GpuDevice for VulkanDevice {
    type Allocation = Allocation;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        unsafe {
            let handle = self.device.create_buffer(&buffer_info, None)
                .map_err(|e| GpuError::vulkan("create buffer", e))?;

            let requirements = self.device.get_buffer_memory_requirements(handle);

            let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_buffer(handle, None);
                    return Err(GpuError::allocation(name, e.to_string()));
                }
            };

            if let Err(e) = self.device.bind_buffer_memory(handle, allocation.memory(), allocation.offset()) {
                self.device.destroy_buffer(handle, None);
                let _ = self.allocator.lock().free(allocation);
                return Err(GpuError::vulkan("bind buffer memory", e));
            }

            Ok((handle, allocation))
        }
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, allocation: Allocation) {
        unsafe {
            self.device.destroy_buffer(buffer, None);
        }
        if let Err(e) = self.allocator.lock().free(allocation) {
            warn!("Failed to free buffer allocation: {}", e);
        }
    }

    fn create_image(
        &self,
        info: &vk::ImageCreateInfo<'_>,
        location: MemoryLocation,
        name: &str,
    ) -> GpuResult<(vk::Image, Allocation)> {
        unsafe {
            let handle = self.device.create_image(info, None)
                .map_err(|e| GpuError::vulkan("create image", e))?;

            let requirements = self.device.get_image_memory_requirements(handle);

            let allocation = match self.allocator.lock().allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear: info.tiling == vk::ImageTiling::LINEAR,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            }) {
                Ok(allocation) => allocation,
                Err(e) => {
                    self.device.destroy_image(handle, None);
                    return Err(GpuError::allocation(name, e.to_string()));
                }
            };

            if let Err(e) = self.device.bind_image_memory(handle, allocation.memory(), allocation.offset()) {
                self.device.destroy_image(handle, None);
                let _ = self.allocator.lock().free(allocation);
                return Err(GpuError::vulkan("bind image memory", e));
            }

            Ok((handle, allocation))
        }
    }

    fn destroy_image(&self, image: vk::Image, allocation: Allocation) {
        unsafe {
            self.device.destroy_image(image, None);
        }
        if let Err(e) = self.allocator.lock().free(allocation) {
            warn!("Failed to free image allocation: {}", e);
        }
    }

    fn buffer_device_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        unsafe { self.device.get_buffer_device_address(&info) }
    }

    fn create_command_pool(&self) -> GpuResult<vk::CommandPool> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER | vk::CommandPoolCreateFlags::TRANSIENT);

        unsafe {
            self.device.create_command_pool(&pool_info, None)
                .map_err(|e| GpuError::vulkan("create command pool", e))
        }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> GpuResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let buffers = unsafe {
            self.device.allocate_command_buffers(&alloc_info)
                .map_err(|e| GpuError::vulkan("allocate command buffer", e))?
        };
        buffers.into_iter().next()
            .ok_or(GpuError::vulkan("allocate command buffer", vk::Result::ERROR_UNKNOWN))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe {
            self.device.reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(|e| GpuError::vulkan("reset command buffer", e))
        }
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            self.device.begin_command_buffer(cmd, &begin_info)
                .map_err(|e| GpuError::vulkan("begin command buffer", e))
        }
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe {
            self.device.end_command_buffer(cmd)
                .map_err(|e| GpuError::vulkan("end command buffer", e))
        }
    }

    fn cmd_copy_buffer(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(cmd, src, dst, regions) }
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer_to_image(cmd, src, dst, layout, regions) }
    }

    fn cmd_pipeline_barrier(
        &self,
        cmd: vk::CommandBuffer,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier<'_>],
        image_barriers: &[vk::ImageMemoryBarrier<'_>],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                memory_barriers,
                &[],
                image_barriers,
            );
        }
    }

    fn create_fence(&self) -> GpuResult<vk::Fence> {
        unsafe {
            self.device.create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(|e| GpuError::vulkan("create fence", e))
        }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe {
            self.device.reset_fences(&[fence])
                .map_err(|e| GpuError::vulkan("reset fence", e))
        }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(GpuError::FenceTimeout(timeout_ns)),
            Err(e) => Err(GpuError::vulkan("wait for fence", e)),
        }
    }

    fn queue_submit(&self, cmd: vk::CommandBuffer, fence: vk::Fence) -> GpuResult<()> {
        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers);

        unsafe {
            self.device.queue_submit(self.queue, &[submit_info], fence)
                .map_err(|e| GpuError::vulkan("queue submit", e))
        }
    }

    fn queue_wait_idle(&self) -> GpuResult<()> {
        unsafe {
            self.device.queue_wait_idle(self.queue)
                .map_err(|e| GpuError::vulkan("queue wait idle", e))
        }
    }

    fn min_scratch_offset_alignment(&self) -> vk::DeviceSize {
        vk::DeviceSize::from(self.rt_capabilities.min_scratch_offset_alignment.max(1))
    }

    fn acceleration_structure_build_sizes(
        &self,
        info: &vk::AccelerationStructureBuildGeometryInfoKHR<'_>,
        max_primitive_counts: &[u32],
    ) -> GpuResult<vk::AccelerationStructureBuildSizesInfoKHR<'static>> {
        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_struct_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                info,
                max_primitive_counts,
                &mut size_info,
            );
        }
        Ok(size_info)
    }

    fn create_acceleration_structure(
        &self,
        info: &vk::AccelerationStructureCreateInfoKHR<'_>,
    ) -> GpuResult<vk::AccelerationStructureKHR> {
        unsafe {
            self.accel_struct_loader.create_acceleration_structure(info, None)
                .map_err(|e| GpuError::vulkan("create acceleration structure", e))
        }
    }

    fn destroy_acceleration_structure(&self, handle: vk::AccelerationStructureKHR) {
        unsafe { self.accel_struct_loader.destroy_acceleration_structure(handle, None) }
    }

    fn acceleration_structure_device_address(
        &self,
        handle: vk::AccelerationStructureKHR,
    ) -> vk::DeviceAddress {
        let addr_info = vk::AccelerationStructureDeviceAddressInfoKHR::default()
            .acceleration_structure(handle);
        unsafe { self.accel_struct_loader.get_acceleration_structure_device_address(&addr_info) }
    }

    fn cmd_build_acceleration_structures(
        &self,
        cmd: vk::CommandBuffer,
        infos: &[vk::AccelerationStructureBuildGeometryInfoKHR<'_>],
        ranges: &[&[vk::AccelerationStructureBuildRangeInfoKHR]],
    ) {
        unsafe { self.accel_struct_loader.cmd_build_acceleration_structures(cmd, infos, ranges) }
    }

    fn cmd_copy_acceleration_structure(
        &self,
        cmd: vk::CommandBuffer,
        info: &vk::CopyAccelerationStructureInfoKHR<'_>,
    ) {
        unsafe { self.accel_struct_loader.cmd_copy_acceleration_structure(cmd, info) }
    }

    fn create_compaction_query_pool(&self, count: u32) -> GpuResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR)
            .query_count(count);

        unsafe {
            self.device.create_query_pool(&info, None)
                .map_err(|e| GpuError::vulkan("create query pool", e))
        }
    }

    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) }
    }

    fn cmd_reset_query_pool(&self, cmd: vk::CommandBuffer, pool: vk::QueryPool, first: u32, count: u32) {
        unsafe { self.device.cmd_reset_query_pool(cmd, pool, first, count) }
    }

    fn cmd_write_compacted_sizes(
        &self,
        cmd: vk::CommandBuffer,
        structures: &[vk::AccelerationStructureKHR],
        pool: vk::QueryPool,
        first_query: u32,
    ) {
        unsafe {
            self.accel_struct_loader.cmd_write_acceleration_structures_properties(
                cmd,
                structures,
                vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                pool,
                first_query,
            );
        }
    }

    fn compacted_sizes(&self, pool: vk::QueryPool, count: u32) -> GpuResult<Vec<vk::DeviceSize>> {
        let mut sizes = vec![0u64; count as usize];
        unsafe {
            self.device.get_query_pool_results(
                pool,
                0,
                &mut sizes,
                vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
            )
            .map_err(|e| GpuError::vulkan("get query pool results", e))?;
        }
        Ok(sizes)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.wait_idle();

        unsafe {
            // The allocator frees its memory blocks through the device.
            ManuallyDrop::drop(&mut self.allocator);

            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan device destroyed");
    }
}

/// Debug callback for validation layers.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[VK] {}", message);
    }

    vk::FALSE
}
