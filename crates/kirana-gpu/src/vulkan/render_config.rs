//! Acceleration structure build configuration.
//!
//! Holds the per-batch size limit, the fence-wait timeout and the default
//! build-flag preference. Values are validated by [`RtBuildConfig::sanitized`].

use ash::vk;

/// Default per-batch limit on cumulative BLAS size (256 MiB).
pub const DEFAULT_BATCH_SIZE_LIMIT: vk::DeviceSize = 256 * 1024 * 1024;

/// Default fence-wait timeout (1 second).
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// Which trade-off the bottom-level builds should favour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuildPreference {
    #[default]
    PreferFastTrace,
    PreferFastBuild,
    /// Fast trace, plus a compaction pass after each batch.
    AllowCompaction,
}

impl BuildPreference {
    /// Build flags for bottom-level structures.
    pub fn blas_flags(self) -> vk::BuildAccelerationStructureFlagsKHR {
        match self {
            BuildPreference::PreferFastTrace => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            BuildPreference::PreferFastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            BuildPreference::AllowCompaction => {
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION
            }
        }
    }

    /// Build flags for the top-level structure. Always refittable.
    pub fn tlas_flags(self) -> vk::BuildAccelerationStructureFlagsKHR {
        let base = match self {
            BuildPreference::PreferFastBuild => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD,
            _ => vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
        };
        base | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
    }
}

/// Configuration for acceleration structure builds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtBuildConfig {
    /// Upper bound on the summed structure size recorded into one command buffer.
    pub batch_size_limit: vk::DeviceSize,
    /// Bound on every fence wait, in nanoseconds.
    pub fence_timeout_ns: u64,
    /// Default build-flag preference.
    pub build_preference: BuildPreference,
}

impl Default for RtBuildConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: DEFAULT_BATCH_SIZE_LIMIT,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            build_preference: BuildPreference::default(),
        }
    }
}

impl RtBuildConfig {
    /// Create a config from explicit values, clamping invalid ones.
    pub fn new(batch_size_limit: vk::DeviceSize, fence_timeout_ns: u64, build_preference: BuildPreference) -> Self {
        Self {
            batch_size_limit,
            fence_timeout_ns,
            build_preference,
        }
        .sanitized()
    }

    pub fn with_batch_size_limit(mut self, limit: vk::DeviceSize) -> Self {
        self.batch_size_limit = limit;
        self.sanitized()
    }

    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self.sanitized()
    }

    pub fn with_build_preference(mut self, preference: BuildPreference) -> Self {
        self.build_preference = preference;
        self
    }

    /// A zero limit degenerates to one record per batch; a zero timeout
    /// would turn every wait into a poll, so it falls back to the default.
    pub fn sanitized(mut self) -> Self {
        self.batch_size_limit = self.batch_size_limit.max(1);
        if self.fence_timeout_ns == 0 {
            self.fence_timeout_ns = DEFAULT_FENCE_TIMEOUT_NS;
        }
        self
    }
}
