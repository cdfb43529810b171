//! Runtime-configurable tuning parameters for nexar-ipc.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `NEXAR_IPC_`) or by constructing a custom `IpcConfig`.

use std::time::Duration;

use crate::device::{LaunchConfig, Platform};

/// Tuning parameters for collective dispatch, kernels and bootstrap.
#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// All-reduce messages up to and including this many bytes take the
    /// packet path; larger ones take the bulk path.
    pub small_msg_bytes: usize,

    /// Capacity of the per-rank scratch buffer used by the packet path.
    pub scratch_bytes: usize,

    /// Accelerator family; selects warp width and default launch geometry.
    pub platform: Platform,

    /// Launch geometry override for the packet kernel.
    pub packet_launch: Option<LaunchConfig>,

    /// Launch geometry override for the bulk kernels.
    pub bulk_launch: Option<LaunchConfig>,

    /// Timeout for a single bootstrap receive during setup.
    pub bootstrap_timeout: Duration,

    /// Busy-spin iterations before a waiting device thread yields its core.
    pub spin_before_yield: u32,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            small_msg_bytes: 1024 * 1024,    // 1 MiB
            scratch_bytes: 16 * 1024 * 1024, // 16 MiB
            platform: Platform::Cuda,
            packet_launch: None,
            bulk_launch: None,
            bootstrap_timeout: Duration::from_secs(30),
            spin_before_yield: 256,
        }
    }
}

impl IpcConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `NEXAR_IPC_SMALL_MSG_BYTES`
    /// - `NEXAR_IPC_SCRATCH_BYTES`
    /// - `NEXAR_IPC_PLATFORM` (`cuda` or `rocm`)
    /// - `NEXAR_IPC_PACKET_BLOCKS` / `NEXAR_IPC_PACKET_THREADS`
    /// - `NEXAR_IPC_BULK_BLOCKS` / `NEXAR_IPC_BULK_THREADS`
    /// - `NEXAR_IPC_BOOTSTRAP_TIMEOUT_SECS`
    /// - `NEXAR_IPC_SPIN_BEFORE_YIELD`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<usize>("NEXAR_IPC_SMALL_MSG_BYTES") {
            cfg.small_msg_bytes = n;
        }
        if let Some(n) = env_parse::<usize>("NEXAR_IPC_SCRATCH_BYTES") {
            cfg.scratch_bytes = n;
        }
        if let Ok(v) = std::env::var("NEXAR_IPC_PLATFORM") {
            if let Some(p) = Platform::parse(&v) {
                cfg.platform = p;
            }
        }
        if let (Some(blocks), Some(threads)) = (
            env_parse::<usize>("NEXAR_IPC_PACKET_BLOCKS"),
            env_parse::<usize>("NEXAR_IPC_PACKET_THREADS"),
        ) {
            cfg.packet_launch = Some(LaunchConfig::new(blocks, threads));
        }
        if let (Some(blocks), Some(threads)) = (
            env_parse::<usize>("NEXAR_IPC_BULK_BLOCKS"),
            env_parse::<usize>("NEXAR_IPC_BULK_THREADS"),
        ) {
            cfg.bulk_launch = Some(LaunchConfig::new(blocks, threads));
        }
        if let Some(s) = env_parse::<u64>("NEXAR_IPC_BOOTSTRAP_TIMEOUT_SECS") {
            cfg.bootstrap_timeout = Duration::from_secs(s);
        }
        if let Some(n) = env_parse::<u32>("NEXAR_IPC_SPIN_BEFORE_YIELD") {
            cfg.spin_before_yield = n;
        }

        cfg
    }

    /// Effective launch geometry of the packet kernel.
    pub fn packet_launch(&self) -> LaunchConfig {
        self.packet_launch
            .unwrap_or_else(|| self.platform.packet_launch())
    }

    /// Effective launch geometry of the bulk kernels.
    pub fn bulk_launch(&self) -> LaunchConfig {
        self.bulk_launch.unwrap_or_else(|| self.platform.bulk_launch())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}
