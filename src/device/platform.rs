use super::LaunchConfig;

/// Accelerator family the engine targets.
///
/// The family fixes the execution-unit group width and the tuned launch
/// geometry of each kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Cuda,
    Rocm,
}

impl Platform {
    /// Threads per warp (wavefront on ROCm).
    pub const fn warp_size(self) -> usize {
        match self {
            Platform::Cuda => 32,
            Platform::Rocm => 64,
        }
    }

    /// Tuned geometry of the packet all-reduce kernel.
    pub const fn packet_launch(self) -> LaunchConfig {
        match self {
            Platform::Cuda => LaunchConfig::new(14, 512),
            Platform::Rocm => LaunchConfig::new(14, 256),
        }
    }

    /// Tuned geometry of the bulk all-reduce and all-gather kernels.
    pub const fn bulk_launch(self) -> LaunchConfig {
        match self {
            Platform::Cuda => LaunchConfig::new(8, 1024),
            Platform::Rocm => LaunchConfig::new(8, 512),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" | "nvidia" => Some(Platform::Cuda),
            "rocm" | "hip" | "amd" => Some(Platform::Rocm),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::Cuda => f.write_str("cuda"),
            Platform::Rocm => f.write_str("rocm"),
        }
    }
}
