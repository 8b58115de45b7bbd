//! Acceleration structure building: one bottom-level structure per mesh,
//! built in size-bounded batches, and one top-level structure per scene.
//!
//! Every submission is fence-confirmed before the next stage starts, so the
//! top-level build only ever reads finished bottom-level structures.

use ash::vk;
use glam::Mat4;
use gpu_allocator::vulkan::Allocation;
use log::{debug, error, info, warn};
use std::cell::RefCell;

use super::batch::{self, BatchGroup};
use super::instance::{GpuInstance, TlasInstance, MAX_INSTANCE_FIELD};
use crate::scene::{MeshDescriptor, SceneData};
use crate::vulkan::commands::CommandSubmissionPool;
use crate::vulkan::device::GpuDevice;
use crate::vulkan::error::{GpuError, GpuResult};
use crate::vulkan::memory::{AllocatedBuffer, AllocationPolicy, MemoryAllocator};
use crate::vulkan::render_config::RtBuildConfig;
use crate::vulkan::align_up;

/// Builder progress. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Unbuilt,
    BlasCreating,
    BlasBuilt,
    TlasCreating,
    Ready,
    Failed,
}

impl BuildState {
    pub fn name(self) -> &'static str {
        match self {
            BuildState::Unbuilt => "Unbuilt",
            BuildState::BlasCreating => "BlasCreating",
            BuildState::BlasBuilt => "BlasBuilt",
            BuildState::TlasCreating => "TlasCreating",
            BuildState::Ready => "Ready",
            BuildState::Failed => "Failed",
        }
    }
}

/// A created acceleration structure and the buffer backing it.
pub struct AccelerationStructure<A = Allocation> {
    pub handle: vk::AccelerationStructureKHR,
    pub buffer: AllocatedBuffer<A>,
    pub device_address: vk::DeviceAddress,
    pub size: vk::DeviceSize,
}

/// Bottom-level build input and result for one mesh.
pub struct BlasRecord<A = Allocation> {
    pub mesh_index: usize,
    pub vertex_address: vk::DeviceAddress,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub max_vertex: u32,
    pub index_address: vk::DeviceAddress,
    pub index_type: vk::IndexType,
    pub primitive_count: u32,
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    pub as_size: vk::DeviceSize,
    pub scratch_size: vk::DeviceSize,
    pub structure: Option<AccelerationStructure<A>>,
}

impl<A> BlasRecord<A> {
    /// Device address of the built structure, once built.
    pub fn device_address(&self) -> Option<vk::DeviceAddress> {
        self.structure.as_ref().map(|s| s.device_address)
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.structure.as_ref().map_or(vk::AccelerationStructureKHR::null(), |s| s.handle)
    }

    /// The single opaque triangle geometry of this mesh.
    fn geometry(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
            .vertex_format(self.vertex_format)
            .vertex_data(vk::DeviceOrHostAddressConstKHR { device_address: self.vertex_address })
            .vertex_stride(self.vertex_stride)
            .max_vertex(self.max_vertex)
            .index_type(self.index_type)
            .index_data(vk::DeviceOrHostAddressConstKHR { device_address: self.index_address });

        vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
    }

    fn build_range(&self) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR::default()
            .primitive_count(self.primitive_count)
            .primitive_offset(0)
            .first_vertex(0)
            .transform_offset(0)
    }
}

fn blas_build_info<'g>(
    flags: vk::BuildAccelerationStructureFlagsKHR,
    geometries: &'g [vk::AccelerationStructureGeometryKHR<'g>],
) -> vk::AccelerationStructureBuildGeometryInfoKHR<'g> {
    vk::AccelerationStructureBuildGeometryInfoKHR::default()
        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
        .flags(flags)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries)
}

/// Scratch memory bound at the device's required alignment.
struct Scratch<A> {
    buffer: AllocatedBuffer<A>,
    address: vk::DeviceAddress,
}

/// Resources a timed-out submission may still be reading or writing.
enum Retired<A> {
    Buffer(AllocatedBuffer<A>),
    Structure(AccelerationStructure<A>),
    QueryPool(vk::QueryPool),
}

/// Builds and owns the bottom- and top-level structures of one scene.
pub struct AccelerationStructureBuilder<'a, 'd, D: GpuDevice> {
    device: &'d D,
    allocator: &'a MemoryAllocator<'d, D>,
    commands: CommandSubmissionPool<'d, D>,
    config: RtBuildConfig,
    state: BuildState,
    records: Vec<BlasRecord<D::Allocation>>,
    /// Record index per mesh; `None` for meshes without geometry.
    mesh_records: Vec<Option<usize>>,
    sizes_known: bool,
    max_scratch_size: vk::DeviceSize,
    total_as_size: vk::DeviceSize,
    batches: Vec<BatchGroup>,
    instances: Vec<TlasInstance>,
    tlas: Option<AccelerationStructure<D::Allocation>>,
    tlas_instance_count: u32,
    tlas_flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Released in `Drop` once the queue is idle.
    retired: RefCell<Vec<Retired<D::Allocation>>>,
}

impl<'a, 'd, D: GpuDevice> AccelerationStructureBuilder<'a, 'd, D> {
    /// Create a builder with its own command pool and fence.
    pub fn new(allocator: &'a MemoryAllocator<'d, D>, config: RtBuildConfig) -> GpuResult<Self> {
        let config = config.sanitized();
        let device = allocator.device();
        let commands = CommandSubmissionPool::new(device, config.fence_timeout_ns)?;

        Ok(Self {
            device,
            allocator,
            commands,
            config,
            state: BuildState::Unbuilt,
            records: Vec::new(),
            mesh_records: Vec::new(),
            sizes_known: false,
            max_scratch_size: 0,
            total_as_size: 0,
            batches: Vec::new(),
            instances: Vec::new(),
            tlas: None,
            tlas_instance_count: 0,
            tlas_flags: vk::BuildAccelerationStructureFlagsKHR::empty(),
            retired: RefCell::new(Vec::new()),
        })
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn config(&self) -> &RtBuildConfig {
        &self.config
    }

    pub fn records(&self) -> &[BlasRecord<D::Allocation>] {
        &self.records
    }

    pub fn batches(&self) -> &[BatchGroup] {
        &self.batches
    }

    pub fn instances(&self) -> &[TlasInstance] {
        &self.instances
    }

    pub fn max_scratch_size(&self) -> vk::DeviceSize {
        self.max_scratch_size
    }

    pub fn total_as_size(&self) -> vk::DeviceSize {
        self.total_as_size
    }

    /// The top-level structure, available only once the builder is `Ready`.
    pub fn tlas_handle(&self) -> Option<vk::AccelerationStructureKHR> {
        match (self.state, &self.tlas) {
            (BuildState::Ready, Some(tlas)) => Some(tlas.handle),
            _ => None,
        }
    }

    pub fn tlas_device_address(&self) -> Option<vk::DeviceAddress> {
        self.tlas_handle().and(self.tlas.as_ref().map(|t| t.device_address))
    }

    fn require(&self, operation: &'static str, allowed: &[BuildState], expected: &'static str) -> GpuResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(GpuError::InvalidState {
                operation,
                expected,
                actual: self.state.name(),
            })
        }
    }

    /// Record a stage failure: log it and make the builder `Failed`.
    fn fail(&mut self, stage: &str, e: &GpuError) {
        error!("Acceleration structure stage '{}' failed: {}", stage, e);
        self.state = BuildState::Failed;
    }

    // ============================================================
    // Bottom level
    // ============================================================

    /// Describe one bottom-level build per non-empty mesh.
    pub fn create_blas_descriptors(&mut self, meshes: &[MeshDescriptor]) -> GpuResult<()> {
        self.require("create_blas_descriptors", &[BuildState::Unbuilt], "Unbuilt")?;
        self.state = BuildState::BlasCreating;

        let flags = self.config.build_preference.blas_flags();
        let mut records = Vec::with_capacity(meshes.len());
        let mut mesh_records = Vec::with_capacity(meshes.len());

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            if mesh.is_empty() {
                debug!("Mesh {} has no geometry, no bottom-level structure", mesh_index);
                mesh_records.push(None);
                continue;
            }
            if let Err(e) = validate_mesh(mesh_index, mesh) {
                self.fail("create_blas_descriptors", &e);
                return Err(e);
            }

            mesh_records.push(Some(records.len()));
            records.push(BlasRecord {
                mesh_index,
                vertex_address: mesh.vertex_address,
                vertex_stride: mesh.vertex_stride,
                vertex_format: mesh.vertex_format,
                max_vertex: mesh.vertex_count - 1,
                index_address: mesh.index_address,
                index_type: mesh.index_type,
                primitive_count: mesh.triangle_count(),
                flags,
                as_size: 0,
                scratch_size: 0,
                structure: None,
            });
        }

        debug!("{} bottom-level descriptors from {} meshes", records.len(), meshes.len());
        self.records = records;
        self.mesh_records = mesh_records;
        Ok(())
    }

    /// Query structure and scratch sizes for every record.
    pub fn compute_build_sizes(&mut self) -> GpuResult<()> {
        self.require("compute_build_sizes", &[BuildState::BlasCreating], "BlasCreating")?;
        self.try_compute_build_sizes()
            .inspect_err(|e| self.fail("compute_build_sizes", e))
    }

    fn try_compute_build_sizes(&mut self) -> GpuResult<()> {
        let mut max_scratch_size = 0;
        let mut total_as_size = 0;

        for record in &mut self.records {
            let geometry = record.geometry();
            let build_info = blas_build_info(record.flags, std::slice::from_ref(&geometry));
            let sizes = self.device.acceleration_structure_build_sizes(&build_info, &[record.primitive_count])?;

            if sizes.acceleration_structure_size == 0 || sizes.build_scratch_size == 0 {
                return Err(GpuError::BuildSizeQuery(format!(
                    "mesh {} ({} triangles) reported zero sizes",
                    record.mesh_index, record.primitive_count
                )));
            }

            record.as_size = sizes.acceleration_structure_size;
            record.scratch_size = sizes.build_scratch_size;
            max_scratch_size = max_scratch_size.max(record.scratch_size);
            total_as_size += record.as_size;
        }

        self.max_scratch_size = max_scratch_size;
        self.total_as_size = total_as_size;
        self.sizes_known = true;
        self.batches.clear();

        debug!(
            "Bottom-level sizes: {} structures, {} bytes total, {} bytes max scratch",
            self.records.len(), total_as_size, max_scratch_size
        );
        Ok(())
    }

    /// Group records into batches whose summed structure size stays within `limit`.
    pub fn batch_by_limit(&mut self, limit: vk::DeviceSize) -> GpuResult<&[BatchGroup]> {
        self.require("batch_by_limit", &[BuildState::BlasCreating], "BlasCreating")?;
        if !self.sizes_known {
            return Err(GpuError::InvalidState {
                operation: "batch_by_limit",
                expected: "BlasCreating with sizes computed",
                actual: self.state.name(),
            });
        }

        let sizes: Vec<vk::DeviceSize> = self.records.iter().map(|r| r.as_size).collect();
        self.batches = batch::batch_by_limit(&sizes, limit.max(1));
        debug!("{} records in {} batches (limit {} bytes)", sizes.len(), self.batches.len(), limit);
        Ok(&self.batches)
    }

    /// Build every bottom-level structure, one fence-confirmed submission per batch.
    ///
    /// Sizes and batches are (re)computed when missing or when `flags`
    /// differ from the flags the sizes were queried with.
    pub fn build_blas(&mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> GpuResult<()> {
        self.require("build_blas", &[BuildState::BlasCreating], "BlasCreating")?;

        match self.try_build_blas(flags) {
            Ok(()) => {
                self.state = BuildState::BlasBuilt;
                info!(
                    "Built {} bottom-level structures in {} batches ({} bytes)",
                    self.records.len(), self.batches.len(), self.total_as_size
                );
                Ok(())
            }
            Err(e) => {
                self.fail("build_blas", &e);
                Err(e)
            }
        }
    }

    fn try_build_blas(&mut self, flags: vk::BuildAccelerationStructureFlagsKHR) -> GpuResult<()> {
        if self.records.iter().any(|r| r.flags != flags) {
            for record in &mut self.records {
                record.flags = flags;
            }
            self.sizes_known = false;
        }
        if !self.sizes_known {
            self.try_compute_build_sizes()?;
        }
        if self.records.is_empty() {
            return Ok(());
        }
        if self.batches.is_empty() {
            let sizes: Vec<vk::DeviceSize> = self.records.iter().map(|r| r.as_size).collect();
            self.batches = batch::batch_by_limit(&sizes, self.config.batch_size_limit);
        }

        let compact = flags.contains(vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION);
        let scratch = self.create_scratch(self.max_scratch_size, "blas_scratch")?;

        let batches = self.batches.clone();
        let mut result = Ok(());
        for (n, group) in batches.iter().enumerate() {
            debug!("Building batch {} ({} structures, {} bytes)", n, group.len(), group.total_size);
            result = self.build_batch(group, scratch.address, compact);
            if result.is_err() {
                break;
            }
        }

        self.release_buffer(scratch.buffer);
        if compact {
            let records = &self.records;
            for group in &mut self.batches {
                group.total_size = group.indices.iter().map(|&i| records[i].as_size).sum();
            }
        }
        result
    }

    fn build_batch(
        &mut self,
        group: &BatchGroup,
        scratch_address: vk::DeviceAddress,
        compact: bool,
    ) -> GpuResult<()> {
        for &index in &group.indices {
            let name = format!("blas_{}", self.records[index].mesh_index);
            let structure = self.create_structure(
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
                self.records[index].as_size,
                &name,
            )?;
            self.records[index].structure = Some(structure);
        }

        let count = group.len() as u32;
        let query_pool = if compact {
            Some(self.device.create_compaction_query_pool(count)?)
        } else {
            None
        };

        let result = self.record_and_submit_batch(group, scratch_address, query_pool);
        let result = match (result, query_pool) {
            (Ok(()), Some(pool)) => self.compact_batch(group, pool),
            (result, _) => result,
        };

        if let Some(pool) = query_pool {
            self.release_query_pool(pool);
        }
        result
    }

    fn record_and_submit_batch(
        &self,
        group: &BatchGroup,
        scratch_address: vk::DeviceAddress,
        query_pool: Option<vk::QueryPool>,
    ) -> GpuResult<()> {
        let cmd = self.commands.begin()?;
        let count = group.len() as u32;

        if let Some(pool) = query_pool {
            self.device.cmd_reset_query_pool(cmd, pool, 0, count);
        }

        for (n, &index) in group.indices.iter().enumerate() {
            // Consecutive builds share the scratch buffer.
            if n > 0 {
                self.commands.acceleration_structure_barrier(cmd);
            }
            let record = &self.records[index];
            let geometry = record.geometry();
            let build_info = blas_build_info(record.flags, std::slice::from_ref(&geometry))
                .dst_acceleration_structure(record.handle())
                .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch_address });
            let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[record.build_range()];

            self.device.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
        }

        if let Some(pool) = query_pool {
            self.commands.acceleration_structure_barrier(cmd);
            let handles: Vec<vk::AccelerationStructureKHR> =
                group.indices.iter().map(|&i| self.records[i].handle()).collect();
            self.device.cmd_write_compacted_sizes(cmd, &handles, pool, 0);
        }

        self.commands.submit_and_wait(cmd)
    }

    /// Copy each structure of a built batch into a smaller one where the
    /// compacted size is smaller, then destroy the originals.
    fn compact_batch(&mut self, group: &BatchGroup, query_pool: vk::QueryPool) -> GpuResult<()> {
        let compacted_sizes = self.device.compacted_sizes(query_pool, group.len() as u32)?;

        let mut compacted: Vec<(usize, AccelerationStructure<D::Allocation>)> = Vec::new();
        let cmd = self.commands.begin()?;

        for (&index, &size) in group.indices.iter().zip(&compacted_sizes) {
            let record = &self.records[index];
            if size == 0 || size >= record.as_size {
                continue;
            }
            let name = format!("blas_{}_compact", record.mesh_index);
            let structure = match self.create_structure(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL, size, &name) {
                Ok(structure) => structure,
                Err(e) => {
                    self.commands.discard(cmd);
                    for (_, structure) in compacted {
                        self.destroy_structure(structure);
                    }
                    return Err(e);
                }
            };

            let copy = vk::CopyAccelerationStructureInfoKHR::default()
                .src(record.handle())
                .dst(structure.handle)
                .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
            self.device.cmd_copy_acceleration_structure(cmd, &copy);
            compacted.push((index, structure));
        }

        if compacted.is_empty() {
            self.commands.discard(cmd);
            return Ok(());
        }

        if let Err(e) = self.commands.submit_and_wait(cmd) {
            for (_, structure) in compacted {
                self.release_structure(structure);
            }
            return Err(e);
        }

        let mut before = 0;
        let mut after = 0;
        for (index, structure) in compacted {
            let record = &mut self.records[index];
            before += record.as_size;
            after += structure.size;
            record.as_size = structure.size;
            let original = record.structure.replace(structure);
            if let Some(original) = original {
                self.destroy_structure(original);
            }
        }
        self.total_as_size = self.total_as_size - before + after;

        debug!("Compacted batch: {} -> {} bytes", before, after);
        Ok(())
    }

    // ============================================================
    // Top level
    // ============================================================

    /// One top-level instance per mesh instance, numbered in scene order.
    ///
    /// Instances of meshes without geometry keep their global index but are
    /// not emitted.
    pub fn create_tlas_instances(&mut self, meshes: &[MeshDescriptor]) -> GpuResult<()> {
        self.require(
            "create_tlas_instances",
            &[BuildState::BlasBuilt, BuildState::Ready],
            "BlasBuilt or Ready",
        )?;

        let mut instances = Vec::new();
        let mut global_index: u32 = 0;

        for (mesh_index, mesh) in meshes.iter().enumerate() {
            let record = match self.mesh_records.get(mesh_index) {
                Some(record) => *record,
                None => {
                    return Err(GpuError::UnsupportedGeometry {
                        mesh: mesh_index,
                        reason: format!("no descriptor; structures were built for {} meshes", self.mesh_records.len()),
                    });
                }
            };

            for instance in &mesh.instances {
                let index = global_index;
                global_index += 1;

                let Some(record) = record else {
                    continue;
                };
                if index > MAX_INSTANCE_FIELD {
                    return Err(GpuError::UnsupportedGeometry {
                        mesh: mesh_index,
                        reason: format!("instance index {} does not fit in 24 bits", index),
                    });
                }

                let blas_address = self.records[record].device_address().unwrap_or(0);
                instances.push(TlasInstance::new(
                    &instance.transform,
                    index,
                    instance.flags.ray_mask(),
                    instance.sbt_offset,
                    blas_address,
                    mesh_index,
                ));
            }
        }

        debug!("{} top-level instances", instances.len());
        self.instances = instances;
        Ok(())
    }

    /// Replace the transform of the instance with `global_index`.
    pub fn set_instance_transform(&mut self, global_index: u32, transform: &Mat4) -> GpuResult<()> {
        let instance = self.instances.iter_mut()
            .find(|i| i.global_index == global_index)
            .ok_or(GpuError::UnknownInstance(global_index))?;
        instance.set_transform(transform);
        Ok(())
    }

    /// Build the top-level structure, or refit it in place when `update` is set.
    ///
    /// A full rebuild over an existing structure is rejected without changing
    /// any state. An update with no existing structure builds it.
    pub fn build_tlas(&mut self, flags: vk::BuildAccelerationStructureFlagsKHR, update: bool) -> GpuResult<()> {
        if !update && self.tlas.is_some() {
            warn!("Top-level structure already built; rebuild request rejected");
            return Err(GpuError::InvalidRebuildRequest);
        }
        self.require("build_tlas", &[BuildState::BlasBuilt, BuildState::Ready], "BlasBuilt or Ready")?;

        let update = update && self.tlas.is_some();
        let count = self.instances.len() as u32;
        if update && count != self.tlas_instance_count {
            return Err(GpuError::InstanceCountMismatch {
                built: self.tlas_instance_count,
                requested: count,
            });
        }

        let flags = if update {
            if flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE != self.tlas_flags {
                debug!("Update keeps the original top-level flags {:?}", self.tlas_flags);
            }
            self.tlas_flags
        } else {
            flags | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
        };

        self.state = BuildState::TlasCreating;
        match self.try_build_tlas(flags, update) {
            Ok(()) => {
                self.state = BuildState::Ready;
                info!(
                    "{} top-level structure over {} instances",
                    if update { "Updated" } else { "Built" },
                    count
                );
                Ok(())
            }
            Err(e) => {
                self.fail("build_tlas", &e);
                Err(e)
            }
        }
    }

    fn try_build_tlas(&mut self, flags: vk::BuildAccelerationStructureFlagsKHR, update: bool) -> GpuResult<()> {
        let gpu_instances: Vec<GpuInstance> = self.instances.iter().map(TlasInstance::to_gpu).collect();
        let bytes: &[u8] = bytemuck::cast_slice(&gpu_instances);
        // An empty scene still needs a valid instance address.
        let size = (bytes.len() as vk::DeviceSize).max(std::mem::size_of::<GpuInstance>() as vk::DeviceSize);

        let instance_buffer = self.allocator.allocate_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            AllocationPolicy::GpuWriteable,
            Some(bytes),
            "tlas_instances",
        )?;

        let result = self.build_tlas_from(&instance_buffer, gpu_instances.len() as u32, flags, update);
        self.release_buffer(instance_buffer);
        result
    }

    fn build_tlas_from(
        &mut self,
        instance_buffer: &AllocatedBuffer<D::Allocation>,
        count: u32,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        update: bool,
    ) -> GpuResult<()> {
        let instance_address = instance_buffer.device_address
            .ok_or_else(|| GpuError::allocation("tlas_instances", "buffer has no device address"))?;

        let instances_data = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR { device_address: instance_address });

        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { instances: instances_data });

        let geometries = [geometry];
        let mode = if update {
            vk::BuildAccelerationStructureModeKHR::UPDATE
        } else {
            vk::BuildAccelerationStructureModeKHR::BUILD
        };
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(flags)
            .mode(mode)
            .geometries(&geometries);

        let sizes = self.device.acceleration_structure_build_sizes(&build_info, &[count])?;
        if sizes.acceleration_structure_size == 0 {
            return Err(GpuError::BuildSizeQuery(format!("top-level structure over {} instances reported zero size", count)));
        }

        let (tlas, scratch_size) = if update {
            let scratch_size = if sizes.update_scratch_size > 0 {
                sizes.update_scratch_size
            } else {
                sizes.build_scratch_size
            };
            (None, scratch_size)
        } else {
            let tlas = self.create_structure(
                vk::AccelerationStructureTypeKHR::TOP_LEVEL,
                sizes.acceleration_structure_size,
                "tlas",
            )?;
            (Some(tlas), sizes.build_scratch_size)
        };

        let dst = match (&tlas, &self.tlas) {
            (Some(new), _) => new.handle,
            (None, Some(existing)) => existing.handle,
            (None, None) => vk::AccelerationStructureKHR::null(),
        };

        let result = self.create_scratch(scratch_size, "tlas_scratch").and_then(|scratch| {
            let build_info = build_info
                .src_acceleration_structure(if update { dst } else { vk::AccelerationStructureKHR::null() })
                .dst_acceleration_structure(dst)
                .scratch_data(vk::DeviceOrHostAddressKHR { device_address: scratch.address });
            let build_range = vk::AccelerationStructureBuildRangeInfoKHR::default()
                .primitive_count(count)
                .primitive_offset(0)
                .first_vertex(0)
                .transform_offset(0);
            let build_ranges: &[vk::AccelerationStructureBuildRangeInfoKHR] = &[build_range];

            let submitted = self.commands.begin().and_then(|cmd| {
                self.commands.acceleration_structure_barrier(cmd);
                self.device.cmd_build_acceleration_structures(cmd, &[build_info], &[build_ranges]);
                self.commands.submit_and_wait(cmd)
            });

            self.release_buffer(scratch.buffer);
            submitted
        });

        match (result, tlas) {
            (Ok(()), Some(tlas)) => {
                self.tlas = Some(tlas);
                self.tlas_instance_count = count;
                self.tlas_flags = flags;
                Ok(())
            }
            (Ok(()), None) => Ok(()),
            (Err(e), Some(tlas)) => {
                self.release_structure(tlas);
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }

    // ============================================================
    // Pipeline
    // ============================================================

    /// Run every stage for `scene` with the configured preference and
    /// return the top-level handle.
    pub fn build(&mut self, scene: &SceneData) -> GpuResult<vk::AccelerationStructureKHR> {
        let preference = self.config.build_preference;

        self.create_blas_descriptors(&scene.meshes)?;
        self.compute_build_sizes()?;
        self.batch_by_limit(self.config.batch_size_limit)?;
        self.build_blas(preference.blas_flags())?;
        self.create_tlas_instances(&scene.meshes)?;
        self.build_tlas(preference.tlas_flags(), false)?;

        self.tlas_handle().ok_or(GpuError::InvalidState {
            operation: "build",
            expected: "Ready",
            actual: self.state.name(),
        })
    }

    // ============================================================
    // Resources
    // ============================================================

    fn create_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: vk::DeviceSize,
        name: &str,
    ) -> GpuResult<AccelerationStructure<D::Allocation>> {
        let mut buffer = self.allocator.allocate_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            AllocationPolicy::GpuReadOnly,
            None,
            name,
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer.handle)
            .size(size)
            .ty(ty);

        let handle = match self.device.create_acceleration_structure(&create_info) {
            Ok(handle) => handle,
            Err(e) => {
                self.allocator.free_buffer(&mut buffer);
                return Err(e);
            }
        };

        Ok(AccelerationStructure {
            handle,
            buffer,
            device_address: self.device.acceleration_structure_device_address(handle),
            size,
        })
    }

    fn destroy_structure(&self, mut structure: AccelerationStructure<D::Allocation>) {
        self.device.destroy_acceleration_structure(structure.handle);
        self.allocator.free_buffer(&mut structure.buffer);
    }

    /// Free a buffer now, or once the queue is idle if a wait timed out.
    fn release_buffer(&self, mut buffer: AllocatedBuffer<D::Allocation>) {
        if self.commands.is_lost() {
            debug!("Deferring release of '{}'", buffer.name());
            self.retired.borrow_mut().push(Retired::Buffer(buffer));
        } else {
            self.allocator.free_buffer(&mut buffer);
        }
    }

    fn release_structure(&self, structure: AccelerationStructure<D::Allocation>) {
        if self.commands.is_lost() {
            self.retired.borrow_mut().push(Retired::Structure(structure));
        } else {
            self.destroy_structure(structure);
        }
    }

    fn release_query_pool(&self, pool: vk::QueryPool) {
        if self.commands.is_lost() {
            self.retired.borrow_mut().push(Retired::QueryPool(pool));
        } else {
            self.device.destroy_query_pool(pool);
        }
    }

    /// Scratch memory of at least `size` bytes starting at an aligned address.
    fn create_scratch(&self, size: vk::DeviceSize, name: &str) -> GpuResult<Scratch<D::Allocation>> {
        let alignment = self.device.min_scratch_offset_alignment().max(1);
        let mut buffer = self.allocator.allocate_buffer(
            size + alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            AllocationPolicy::GpuReadOnly,
            None,
            name,
        )?;

        match buffer.device_address {
            Some(base) => Ok(Scratch {
                address: align_up(base, alignment),
                buffer,
            }),
            None => {
                self.allocator.free_buffer(&mut buffer);
                Err(GpuError::allocation(name, "buffer has no device address"))
            }
        }
    }
}

impl<D: GpuDevice> Drop for AccelerationStructureBuilder<'_, '_, D> {
    fn drop(&mut self) {
        let retired = std::mem::take(self.retired.get_mut());
        if self.commands.is_lost() || !retired.is_empty() {
            if let Err(e) = self.device.queue_wait_idle() {
                error!("Queue wait before structure teardown failed: {}", e);
            }
        }

        for entry in retired {
            match entry {
                Retired::Buffer(mut buffer) => self.allocator.free_buffer(&mut buffer),
                Retired::Structure(structure) => self.destroy_structure(structure),
                Retired::QueryPool(pool) => self.device.destroy_query_pool(pool),
            }
        }

        for record in &mut self.records {
            if let Some(mut structure) = record.structure.take() {
                self.device.destroy_acceleration_structure(structure.handle);
                self.allocator.free_buffer(&mut structure.buffer);
            }
        }
        if let Some(mut tlas) = self.tlas.take() {
            self.device.destroy_acceleration_structure(tlas.handle);
            self.allocator.free_buffer(&mut tlas.buffer);
        }
        debug!("Acceleration structures released");
    }
}

fn validate_mesh(mesh_index: usize, mesh: &MeshDescriptor) -> GpuResult<()> {
    let unsupported = |reason: String| GpuError::UnsupportedGeometry { mesh: mesh_index, reason };

    if mesh.topology != vk::PrimitiveTopology::TRIANGLE_LIST {
        return Err(unsupported(format!("topology {:?} is not a triangle list", mesh.topology)));
    }
    if mesh.index_count % 3 != 0 {
        return Err(unsupported(format!("index count {} is not a multiple of 3", mesh.index_count)));
    }
    if mesh.index_type == vk::IndexType::NONE_KHR {
        return Err(unsupported("non-indexed geometry".to_string()));
    }
    if mesh.vertex_address == 0 || mesh.index_address == 0 {
        return Err(unsupported("vertex or index buffer has no device address".to_string()));
    }
    Ok(())
}
