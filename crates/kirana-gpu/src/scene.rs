//! Scene input for acceleration structure builds: ordered meshes, each with
//! its ordered list of placed instances.

use ash::vk;
use glam::Mat4;

// ============================================================
// Instance flags
// ============================================================

bitflags::bitflags! {
    /// Per-instance visibility and selection state.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct InstanceFlags: u32 {
        /// Hit by final-render rays.
        const RENDER_VISIBLE   = 0x00000001;
        /// Hit by interactive viewport rays.
        const VIEWPORT_VISIBLE = 0x00000002;
        const SELECTABLE       = 0x00000004;
        const SELECTED         = 0x00000008;
    }
}

impl Default for InstanceFlags {
    fn default() -> Self {
        InstanceFlags::RENDER_VISIBLE | InstanceFlags::VIEWPORT_VISIBLE | InstanceFlags::SELECTABLE
    }
}

impl InstanceFlags {
    /// 8-bit ray mask for the top-level instance record.
    ///
    /// Each flag owns one mask bit. An instance that is visible to neither
    /// ray class gets mask 0 and is never hit.
    pub fn ray_mask(self) -> u8 {
        if !self.intersects(InstanceFlags::RENDER_VISIBLE | InstanceFlags::VIEWPORT_VISIBLE) {
            return 0;
        }
        (self.bits() & 0xFF) as u8
    }
}

// ============================================================
// Meshes and instances
// ============================================================

/// One placement of a mesh in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshInstance {
    pub transform: Mat4,
    pub flags: InstanceFlags,
    /// Hit-group record offset in the shader binding table.
    pub sbt_offset: u32,
}

impl MeshInstance {
    pub fn new(transform: Mat4) -> Self {
        Self {
            transform,
            flags: InstanceFlags::default(),
            sbt_offset: 0,
        }
    }

    pub fn with_flags(mut self, flags: InstanceFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_sbt_offset(mut self, offset: u32) -> Self {
        self.sbt_offset = offset;
        self
    }
}

/// Geometry already resident on the GPU, addressed by device address.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDescriptor {
    pub vertex_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
    pub vertex_format: vk::Format,
    pub index_address: vk::DeviceAddress,
    pub index_count: u32,
    pub index_type: vk::IndexType,
    pub topology: vk::PrimitiveTopology,
    pub instances: Vec<MeshInstance>,
}

impl MeshDescriptor {
    /// Indexed triangle list with `vec3` float positions and 32-bit indices.
    pub fn triangles(
        vertex_address: vk::DeviceAddress,
        vertex_count: u32,
        vertex_stride: vk::DeviceSize,
        index_address: vk::DeviceAddress,
        index_count: u32,
    ) -> Self {
        Self {
            vertex_address,
            vertex_count,
            vertex_stride,
            vertex_format: vk::Format::R32G32B32_SFLOAT,
            index_address,
            index_count,
            index_type: vk::IndexType::UINT32,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            instances: Vec::new(),
        }
    }

    pub fn with_instance(mut self, instance: MeshInstance) -> Self {
        self.instances.push(instance);
        self
    }

    /// No geometry to build.
    pub fn is_empty(&self) -> bool {
        self.index_count == 0 || self.vertex_count == 0
    }

    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Ordered meshes of one loaded scene.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneData {
    pub meshes: Vec<MeshDescriptor>,
}

impl SceneData {
    pub fn new(meshes: Vec<MeshDescriptor>) -> Self {
        Self { meshes }
    }

    pub fn push_mesh(&mut self, mesh: MeshDescriptor) -> usize {
        self.meshes.push(mesh);
        self.meshes.len() - 1
    }

    /// Instances across all meshes, in global index order.
    pub fn instance_count(&self) -> usize {
        self.meshes.iter().map(|m| m.instances.len()).sum()
    }
}
