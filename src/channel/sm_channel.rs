use std::sync::Arc;

use super::packet;
use super::semaphore::Semaphore;
use crate::device::{DeviceBuffer, copy_region};
use crate::error::Result;
use crate::transport::{Connection, RegisteredMemory};
use crate::types::Rank;

/// Memory channel to one peer.
///
/// Pairs the connection's semaphore with a local mapping of the peer's
/// registered memory and one of this rank's own buffers.
pub struct SmChannel {
    semaphore: Arc<Semaphore>,
    remote: RegisteredMemory,
    dst: DeviceBuffer,
    src: DeviceBuffer,
}

impl SmChannel {
    /// Map `remote` through `conn` and pair it with the local buffer `src`.
    pub(crate) fn connect(
        conn: &Connection,
        semaphore: Arc<Semaphore>,
        remote: RegisteredMemory,
        src: DeviceBuffer,
    ) -> Result<Self> {
        let dst = conn.map(&remote)?;
        Ok(Self::with_mapping(semaphore, remote, dst, src))
    }

    /// Pair an already mapped peer buffer with the local buffer `src`.
    pub(crate) fn with_mapping(
        semaphore: Arc<Semaphore>,
        remote: RegisteredMemory,
        dst: DeviceBuffer,
        src: DeviceBuffer,
    ) -> Self {
        Self {
            semaphore,
            remote,
            dst,
            src,
        }
    }

    pub fn peer(&self) -> Rank {
        self.semaphore.peer()
    }

    /// Registration of the peer memory this channel targets.
    pub fn remote(&self) -> &RegisteredMemory {
        &self.remote
    }

    pub(crate) fn device_handle(&self) -> DeviceChannel {
        DeviceChannel {
            semaphore: Arc::clone(&self.semaphore),
            dst: self.dst.clone(),
            src: self.src.clone(),
        }
    }
}

/// Kernel-side view of an [`SmChannel`].
#[derive(Clone)]
pub(crate) struct DeviceChannel {
    semaphore: Arc<Semaphore>,
    dst: DeviceBuffer,
    src: DeviceBuffer,
}

impl DeviceChannel {
    pub(crate) fn peer(&self) -> Rank {
        self.semaphore.peer()
    }

    /// The peer's memory, mapped locally.
    pub(crate) fn remote(&self) -> &DeviceBuffer {
        &self.dst
    }

    #[cfg(test)]
    pub(crate) fn local(&self) -> &DeviceBuffer {
        &self.src
    }

    #[inline]
    pub(crate) fn signal(&self) {
        self.semaphore.signal();
    }

    #[inline]
    pub(crate) fn relaxed_signal(&self) {
        self.semaphore.relaxed_signal();
    }

    #[inline]
    pub(crate) fn wait(&self) {
        self.semaphore.wait();
    }

    /// Read `len` bytes at `offset` of the peer buffer into the same range
    /// of the local buffer. Thread `tid` of `n` takes its share.
    #[inline]
    pub(crate) fn get(&self, offset: usize, len: usize, tid: usize, n: usize) {
        copy_region(&self.src, offset, &self.dst, offset, len, tid, n);
    }

    /// Store one flagged packet into slot `index` of the peer buffer.
    #[inline]
    pub(crate) fn put_packet(&self, index: usize, data: u32, flag: u32) {
        packet::write(&self.dst, index, data, flag);
    }
}
