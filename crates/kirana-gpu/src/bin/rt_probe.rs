//! Build a small ray tracing scene on the local GPU and report the result.
//!
//! Usage:
//!   cargo run --bin rt_probe -- [--validation] [--instances N] [--batch-limit BYTES] [--compact]

use ash::vk;
use glam::{Mat4, Vec3};
use log::{error, info};
use std::process::ExitCode;

use kirana_gpu::vulkan::raytracing::AccelerationStructureBuilder;
use kirana_gpu::vulkan::{AllocatedBuffer, AllocationPolicy, BuildPreference, GpuResult, MemoryAllocator, RtBuildConfig, VulkanDevice};
use kirana_gpu::{logging, MeshDescriptor, MeshInstance, SceneData};

const TRIANGLE_POSITIONS: [[f32; 3]; 3] = [
    [-0.5, -0.5, 0.0],
    [0.5, -0.5, 0.0],
    [0.0, 0.5, 0.0],
];
const TRIANGLE_INDICES: [u32; 3] = [0, 1, 2];

struct Options {
    validation: bool,
    instances: u32,
    config: RtBuildConfig,
}

fn parse_options() -> Options {
    let args: Vec<String> = std::env::args().collect();

    let value_of = |flag: &str| args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse::<u64>().ok());

    let mut config = RtBuildConfig::default();
    if let Some(limit) = value_of("--batch-limit") {
        config = config.with_batch_size_limit(limit);
    }
    if args.iter().any(|a| a == "--compact") {
        config = config.with_build_preference(BuildPreference::AllowCompaction);
    }

    Options {
        validation: args.iter().any(|a| a == "--validation"),
        instances: value_of("--instances").map_or(4, |n| n.clamp(1, 4096) as u32),
        config,
    }
}

fn geometry_buffer(allocator: &MemoryAllocator<'_, VulkanDevice>, data: &[u8], name: &str) -> GpuResult<AllocatedBuffer> {
    allocator.allocate_buffer(
        data.len() as vk::DeviceSize,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::STORAGE_BUFFER,
        AllocationPolicy::GpuReadOnly,
        Some(data),
        name,
    )
}

fn run(options: &Options) -> GpuResult<()> {
    let device = VulkanDevice::new(options.validation)?;
    let caps = &device.rt_capabilities;
    info!(
        "Device: max instances {}, max primitives {}, scratch alignment {}",
        caps.max_instance_count, caps.max_primitive_count, caps.min_scratch_offset_alignment
    );

    let allocator = MemoryAllocator::new(&device, options.config.fence_timeout_ns)?;
    let mut vertices = geometry_buffer(&allocator, bytemuck::cast_slice(&TRIANGLE_POSITIONS), "probe_vertices")?;
    let mut indices = match geometry_buffer(&allocator, bytemuck::cast_slice(&TRIANGLE_INDICES), "probe_indices") {
        Ok(buffer) => buffer,
        Err(e) => {
            allocator.free_buffer(&mut vertices);
            return Err(e);
        }
    };

    let result = build_scene(&allocator, &vertices, &indices, options);

    allocator.free_buffer(&mut indices);
    allocator.free_buffer(&mut vertices);
    result
}

fn build_scene(
    allocator: &MemoryAllocator<'_, VulkanDevice>,
    vertices: &AllocatedBuffer,
    indices: &AllocatedBuffer,
    options: &Options,
) -> GpuResult<()> {
    let mut mesh = MeshDescriptor::triangles(
        vertices.device_address.unwrap_or(0),
        TRIANGLE_POSITIONS.len() as u32,
        std::mem::size_of::<[f32; 3]>() as vk::DeviceSize,
        indices.device_address.unwrap_or(0),
        TRIANGLE_INDICES.len() as u32,
    );
    for i in 0..options.instances {
        let offset = Vec3::new(i as f32 * 1.5, 0.0, 0.0);
        mesh = mesh.with_instance(MeshInstance::new(Mat4::from_translation(offset)));
    }
    let scene = SceneData::new(vec![mesh]);

    let mut builder = AccelerationStructureBuilder::new(allocator, options.config)?;
    let tlas = builder.build(&scene)?;
    info!(
        "TLAS {:?} at {:#x}: {} BLAS ({} bytes), {} instances",
        tlas,
        builder.tlas_device_address().unwrap_or(0),
        builder.records().len(),
        builder.total_as_size(),
        builder.instances().len()
    );

    builder.set_instance_transform(0, &Mat4::from_rotation_y(std::f32::consts::FRAC_PI_4))?;
    builder.build_tlas(options.config.build_preference.tlas_flags(), true)?;
    info!("TLAS refit after moving instance 0");
    Ok(())
}

fn main() -> ExitCode {
    logging::init();
    let options = parse_options();

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Ray tracing probe failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
