//! Memory registration and peer connections.

use crate::device::{DeviceBuffer, IpcHandle, ipc};
use crate::error::{IpcError, Result};
use crate::transport::Bootstrap;
use crate::types::Rank;

/// Set of transports a registration can be reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransportFlags(u32);

impl TransportFlags {
    pub const NONE: Self = Self(0);
    pub const CUDA_IPC: Self = Self(1);
    pub const IB0: Self = Self(1 << 1);
    pub const IB1: Self = Self(1 << 2);
    pub const IB2: Self = Self(1 << 3);
    pub const IB3: Self = Self(1 << 4);
    pub const IB4: Self = Self(1 << 5);
    pub const IB5: Self = Self(1 << 6);
    pub const IB6: Self = Self(1 << 7);
    pub const IB7: Self = Self(1 << 8);
    pub const ALL_IB: Self = Self(0xFF << 1);
    pub const ALL: Self = Self(0x1FF);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for TransportFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Concrete transport of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Same-host device memory mapping.
    CudaIpc,
    /// Network port `n` (0..8). Peers on other hosts are reached this way.
    Ib(u8),
}

impl Transport {
    pub fn flag(self) -> TransportFlags {
        match self {
            Transport::CudaIpc => TransportFlags::CUDA_IPC,
            Transport::Ib(n) => TransportFlags(1 << (1 + (n as u32 & 7))),
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::CudaIpc => f.write_str("cuda-ipc"),
            Transport::Ib(n) => write!(f, "ib{n}"),
        }
    }
}

#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, PartialEq)]
struct MemoryDescriptor {
    rank: u32,
    handle: u64,
    size: u64,
    transports: u32,
    host: String,
}

/// Device memory a rank has made reachable to its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredMemory {
    rank: Rank,
    handle: IpcHandle,
    size: usize,
    transports: TransportFlags,
    host: String,
}

impl RegisteredMemory {
    /// Register `buf` so that peers reachable through `transports` can map it.
    pub(crate) fn register(
        buf: &DeviceBuffer,
        rank: Rank,
        host: &str,
        transports: TransportFlags,
    ) -> Result<Self> {
        Ok(Self {
            rank,
            handle: ipc::export_memory(buf, host)?,
            size: buf.len(),
            transports,
            host: host.to_owned(),
        })
    }

    /// Rank that owns the memory.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn transports(&self) -> TransportFlags {
        self.transports
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Encode the registration for shipping to a peer.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let desc = MemoryDescriptor {
            rank: self.rank,
            handle: self.handle.as_u64(),
            size: self.size as u64,
            transports: self.transports.bits(),
            host: self.host.clone(),
        };
        rkyv::to_bytes::<rkyv::rancor::Error>(&desc)
            .map(|b| b.to_vec())
            .map_err(|e| IpcError::EncodeFailed(e.to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        let desc = rkyv::from_bytes::<MemoryDescriptor, rkyv::rancor::Error>(&aligned)
            .map_err(|e| IpcError::DecodeFailed(e.to_string()))?;
        Ok(Self {
            rank: desc.rank,
            handle: IpcHandle::from_u64(desc.handle),
            size: desc.size as usize,
            transports: TransportFlags::from_bits_truncate(desc.transports),
            host: desc.host,
        })
    }
}

/// A link from this rank to one peer.
#[derive(Debug, Clone)]
pub struct Connection {
    local_rank: Rank,
    remote_rank: Rank,
    local_host: String,
    transport: Transport,
}

impl Connection {
    /// Same-host peers get a memory-mapping link, others a network link.
    pub(crate) fn new(local_rank: Rank, local_host: &str, remote_rank: Rank, remote_host: &str) -> Self {
        let transport = if local_host == remote_host {
            Transport::CudaIpc
        } else {
            Transport::Ib(0)
        };
        Self {
            local_rank,
            remote_rank,
            local_host: local_host.to_owned(),
            transport,
        }
    }

    pub fn local_rank(&self) -> Rank {
        self.local_rank
    }

    pub fn remote_rank(&self) -> Rank {
        self.remote_rank
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn is_ipc(&self) -> bool {
        self.transport == Transport::CudaIpc
    }

    /// Map the peer's registered memory for direct load/store access.
    pub(crate) fn map(&self, remote: &RegisteredMemory) -> Result<DeviceBuffer> {
        if !self.is_ipc() {
            return Err(IpcError::Unimplemented {
                operation: "mapping memory over a network transport",
            });
        }
        if remote.rank != self.remote_rank {
            return Err(IpcError::Remote {
                rank: self.remote_rank,
                reason: format!("sent a registration owned by rank {}", remote.rank),
            });
        }
        if !remote.transports.contains(TransportFlags::CUDA_IPC) {
            return Err(IpcError::Remote {
                rank: self.remote_rank,
                reason: "memory is not registered for ipc".into(),
            });
        }
        ipc::open_memory(remote.handle, &self.local_host)
    }
}

/// Bootstrap tag for registration exchanges.
const TAG_REGISTRATION: u64 = 0x5245_4749;

/// Send `local` to every rank in `peers`, then collect their registrations
/// in the same (ascending) order.
///
/// Collective among `peers`: each of them must exchange with this rank.
pub(crate) async fn exchange_registrations(
    bootstrap: &dyn Bootstrap,
    local: &RegisteredMemory,
    peers: &[Rank],
) -> Result<Vec<RegisteredMemory>> {
    let bytes = local.serialize()?;
    for &peer in peers {
        bootstrap.send(peer, TAG_REGISTRATION, &bytes).await?;
    }
    let mut remote = Vec::with_capacity(peers.len());
    for &peer in peers {
        let mem = RegisteredMemory::deserialize(&bootstrap.recv(peer, TAG_REGISTRATION).await?)?;
        remote.push(mem);
    }
    Ok(remote)
}
