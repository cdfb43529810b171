use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::fatal_device_error;

/// Grid geometry of a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LaunchConfig {
    pub blocks: usize,
    pub threads: usize,
}

impl LaunchConfig {
    pub const fn new(blocks: usize, threads: usize) -> Self {
        Self { blocks, threads }
    }

    pub const fn total_threads(&self) -> usize {
        self.blocks * self.threads
    }
}

/// Position of one logical device thread within its launch.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ThreadIdx {
    pub block: usize,
    pub thread: usize,
    pub block_dim: usize,
    pub grid_dim: usize,
    pub warp_size: usize,
}

impl ThreadIdx {
    #[inline]
    pub fn global(&self) -> usize {
        self.block * self.block_dim + self.thread
    }

    #[inline]
    pub fn grid_threads(&self) -> usize {
        self.block_dim * self.grid_dim
    }

    /// Index within the warp.
    #[inline]
    pub fn lane(&self) -> usize {
        self.thread % self.warp_size
    }

    #[inline]
    pub fn global_warp(&self) -> usize {
        self.global() / self.warp_size
    }

    #[inline]
    pub fn grid_warps(&self) -> usize {
        self.grid_threads() / self.warp_size
    }
}

/// Synchronization scope between two kernel phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseSync {
    /// Threads of one block agree.
    Block,
    /// Every thread of the grid agrees.
    Grid,
}

/// A device kernel, expressed as a sequence of phases.
///
/// Every thread runs phase `k` before any thread of its block (or of the
/// grid, per [`Kernel::sync_after`]) starts phase `k + 1`. Memory effects of
/// earlier phases are visible to later ones across the barrier.
pub(crate) trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    fn phases(&self) -> usize;

    fn sync_after(&self, _phase: usize) -> PhaseSync {
        PhaseSync::Block
    }

    /// Runs once per launch, in stream order, before any thread starts.
    fn prepare(&self) {}

    fn run(&self, phase: usize, t: &ThreadIdx);
}

/// Grid-wide barrier shared by all blocks of one launch.
struct DeviceSyncer {
    barrier: std::sync::Barrier,
}

impl DeviceSyncer {
    fn new(blocks: usize) -> Self {
        Self {
            barrier: std::sync::Barrier::new(blocks),
        }
    }

    fn sync(&self) {
        self.barrier.wait();
    }
}

/// Execute `kernel` over the whole grid and return when every block is done.
///
/// Each block runs on its own OS thread and steps its threads through one
/// phase at a time. A fault inside a block is not recoverable and aborts
/// the process.
pub(crate) fn run_grid(kernel: &dyn Kernel, cfg: LaunchConfig, warp_size: usize) {
    if cfg.blocks == 0 || cfg.threads == 0 {
        return;
    }
    kernel.prepare();
    let phases = kernel.phases();
    let syncer = DeviceSyncer::new(cfg.blocks);

    std::thread::scope(|s| {
        for block in 0..cfg.blocks {
            let syncer = &syncer;
            let body = move || {
                for phase in 0..phases {
                    for thread in 0..cfg.threads {
                        let t = ThreadIdx {
                            block,
                            thread,
                            block_dim: cfg.threads,
                            grid_dim: cfg.blocks,
                            warp_size,
                        };
                        kernel.run(phase, &t);
                    }
                    if phase + 1 < phases && kernel.sync_after(phase) == PhaseSync::Grid {
                        syncer.sync();
                    }
                }
            };
            let spawned = std::thread::Builder::new()
                .name(format!("{}-b{block}", kernel.name()))
                .spawn_scoped(s, move || {
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(body)) {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".into());
                        fatal_device_error(kernel.name(), &detail);
                    }
                });
            if let Err(e) = spawned {
                fatal_device_error(kernel.name(), &e);
            }
        }
    });
}

/// Spin on `ready` with a bounded busy phase before yielding the core.
#[inline]
pub(crate) fn spin_until(mut ready: impl FnMut() -> bool, spin_before_yield: u32) {
    let mut spins = 0u32;
    while !ready() {
        if spins < spin_before_yield {
            spins += 1;
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}
