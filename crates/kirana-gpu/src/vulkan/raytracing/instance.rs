//! Top-level instance records and their packed GPU layout.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Highest value representable in the 24-bit custom index and SBT offset fields.
pub const MAX_INSTANCE_FIELD: u32 = 0x00FF_FFFF;

/// Instance data as consumed by the top-level build
/// (`VkAccelerationStructureInstanceKHR` layout).
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct GpuInstance {
    pub transform: [[f32; 4]; 3],
    pub instance_custom_index_and_mask: u32,
    pub instance_shader_binding_table_record_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl Default for GpuInstance {
    fn default() -> Self {
        Self {
            transform: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
            instance_custom_index_and_mask: 0xFF << 24,
            instance_shader_binding_table_record_offset_and_flags: 0,
            acceleration_structure_reference: 0,
        }
    }
}

/// One placed instance of a bottom-level structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
    /// Position in the scene-wide instance order; exposed to shaders as the
    /// custom index.
    pub global_index: u32,
    pub mask: u8,
    pub sbt_offset: u32,
    pub blas_address: vk::DeviceAddress,
    pub mesh_index: usize,
}

impl TlasInstance {
    pub fn new(
        transform: &Mat4,
        global_index: u32,
        mask: u8,
        sbt_offset: u32,
        blas_address: vk::DeviceAddress,
        mesh_index: usize,
    ) -> Self {
        Self {
            transform: row_major_3x4(transform),
            global_index,
            mask,
            sbt_offset,
            blas_address,
            mesh_index,
        }
    }

    pub fn set_transform(&mut self, transform: &Mat4) {
        self.transform = row_major_3x4(transform);
    }

    /// Pack into the driver layout. Index and offset are truncated to 24 bits.
    pub fn to_gpu(&self) -> GpuInstance {
        let flags = vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE;
        GpuInstance {
            transform: self.transform,
            instance_custom_index_and_mask: ((self.mask as u32) << 24) | (self.global_index & MAX_INSTANCE_FIELD),
            instance_shader_binding_table_record_offset_and_flags:
                (flags.as_raw() << 24) | (self.sbt_offset & MAX_INSTANCE_FIELD),
            acceleration_structure_reference: self.blas_address,
        }
    }
}

/// Top three rows of an affine column-major matrix, row by row.
pub fn row_major_3x4(m: &Mat4) -> [[f32; 4]; 3] {
    [
        m.row(0).to_array(),
        m.row(1).to_array(),
        m.row(2).to_array(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn test_gpu_instance_matches_driver_layout() {
        assert_eq!(std::mem::size_of::<GpuInstance>(), 64);
        assert_eq!(
            std::mem::size_of::<GpuInstance>(),
            std::mem::size_of::<vk::AccelerationStructureInstanceKHR>()
        );
    }

    #[test]
    fn test_identity_transform() {
        let rows = row_major_3x4(&Mat4::IDENTITY);
        assert_eq!(rows, GpuInstance::default().transform);
    }

    #[test]
    fn test_translation_lands_in_last_column() {
        let rows = row_major_3x4(&Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(rows[0][3], 1.0);
        assert_eq!(rows[1][3], 2.0);
        assert_eq!(rows[2][3], 3.0);
    }

    #[test]
    fn test_rotation_is_transposed_into_rows() {
        let m = Mat4::from_quat(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let rows = row_major_3x4(&m);
        // x axis maps to +y: column 0 is (0, 1, 0), so row 1 starts with 1.
        assert!((rows[1][0] - 1.0).abs() < 1e-6);
        assert!((rows[0][1] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_packing() {
        let instance = TlasInstance::new(&Mat4::IDENTITY, 5, 0x0B, 3, 0xDEAD_0000, 0);
        let gpu = instance.to_gpu();

        assert_eq!(gpu.instance_custom_index_and_mask >> 24, 0x0B);
        assert_eq!(gpu.instance_custom_index_and_mask & MAX_INSTANCE_FIELD, 5);
        assert_eq!(gpu.instance_shader_binding_table_record_offset_and_flags & MAX_INSTANCE_FIELD, 3);
        assert_eq!(
            gpu.instance_shader_binding_table_record_offset_and_flags >> 24,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(gpu.acceleration_structure_reference, 0xDEAD_0000);
    }

    #[test]
    fn test_set_transform() {
        let mut instance = TlasInstance::new(&Mat4::IDENTITY, 0, 0xFF, 0, 1, 0);
        instance.set_transform(&Mat4::from_scale(Vec3::splat(2.0)));
        assert_eq!(instance.transform[0][0], 2.0);
        assert_eq!(instance.transform[2][2], 2.0);
    }

    #[test]
    fn test_bytes_are_packed_back_to_back() {
        let instances = [GpuInstance::default(); 3];
        let bytes: &[u8] = bytemuck::cast_slice(&instances);
        assert_eq!(bytes.len(), 3 * 64);
    }
}
