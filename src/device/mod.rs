//! Host-backed device runtime.
//!
//! Memory, IPC handles, streams and kernel launches behave like their
//! accelerator counterparts: allocations are shared word-addressable memory,
//! kernels run as grids of blocks, and streams execute work asynchronously
//! in submission order.

pub(crate) mod ipc;
pub(crate) mod launch;
mod memory;
mod platform;
mod stream;

pub use ipc::IpcHandle;
pub use launch::LaunchConfig;
pub use memory::{BufferId, DeviceBuffer};
pub use platform::Platform;
pub use stream::Stream;

pub(crate) use launch::{Kernel, PhaseSync, ThreadIdx, spin_until};
pub(crate) use memory::{DeviceSlice, LANE_BYTES, copy_region};

use crate::error::{IpcError, Result};
use crate::types::Element;

/// One accelerator, identified by its ordinal on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    ordinal: u32,
    host: String,
}

impl Device {
    /// Device `ordinal` on the local host.
    pub fn new(ordinal: u32) -> Self {
        Self {
            ordinal,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    /// Pretend the device lives on `host`. Ranks on different hosts cannot
    /// map each other's memory.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Allocate `bytes` of zeroed device memory.
    pub fn alloc(&self, bytes: usize) -> Result<DeviceBuffer> {
        if bytes == 0 {
            return Err(IpcError::invalid("cannot allocate a zero-byte buffer"));
        }
        Ok(DeviceBuffer::zeroed(self.ordinal, bytes))
    }

    /// Allocate a buffer sized for `values` and upload them.
    pub fn alloc_from<T: Element>(&self, values: &[T]) -> Result<DeviceBuffer> {
        let buf = self.alloc(std::mem::size_of_val(values))?;
        buf.copy_from_host(values)?;
        Ok(buf)
    }

    pub fn create_stream(&self) -> Result<Stream> {
        Stream::new(self)
    }
}
