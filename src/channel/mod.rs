//! Peer channels: semaphores, memory channels and the channel cache.

mod packet;
mod registry;
mod semaphore;
mod sm_channel;

pub use registry::{ChannelKey, ChannelPath, ChannelPurpose};
pub use sm_channel::SmChannel;

pub(crate) use packet::{PACKET_BYTES, flag_for, read as read_packet};
pub(crate) use registry::{ChannelRegistry, ChannelTable, ConstantBank};
pub(crate) use sm_channel::DeviceChannel;

use std::sync::Arc;

use crate::device::DeviceBuffer;
use crate::error::Result;
use crate::topology::NodeTopology;
use crate::transport::{Bootstrap, Connection, RegisteredMemory, TransportFlags, exchange_registrations};
use crate::types::Rank;
use semaphore::{Semaphore, setup_semaphores};

/// Everything this rank holds for one same-host peer.
pub(crate) struct PeerLink {
    pub connection: Connection,
    pub semaphore: Arc<Semaphore>,
    /// Registration of the peer's scratch buffer.
    pub remote_scratch: RegisteredMemory,
    /// The peer's scratch buffer, mapped locally.
    pub scratch_view: DeviceBuffer,
}

/// Connection state of one rank: the bootstrap plus a link per same-host
/// peer, in ascending peer order.
pub(crate) struct Fabric {
    pub bootstrap: Arc<dyn Bootstrap>,
    pub rank: Rank,
    pub host: String,
    pub links: Vec<PeerLink>,
    /// Peers on other hosts. They have a connection but no memory channel.
    pub remote_peers: Vec<Connection>,
}

impl Fabric {
    /// Connect to every peer, set up semaphores with same-host peers and
    /// exchange scratch registrations with them.
    ///
    /// Collective across the whole group.
    pub(crate) async fn connect(
        bootstrap: Arc<dyn Bootstrap>,
        topology: &NodeTopology,
        scratch: &DeviceBuffer,
        spin_before_yield: u32,
    ) -> Result<Self> {
        let rank = bootstrap.rank();
        let host = topology.hostname.clone();

        let (ipc, remote_peers): (Vec<Connection>, Vec<Connection>) = (0..bootstrap.world_size())
            .filter(|&peer| peer != rank)
            .map(|peer| {
                let peer_host = topology.host_of(peer).unwrap_or_default();
                Connection::new(rank, &host, peer, peer_host)
            })
            .partition(Connection::is_ipc);

        for conn in &remote_peers {
            tracing::warn!(
                rank,
                peer = conn.remote_rank(),
                transport = %conn.transport(),
                "peer is not reachable over ipc; no memory channel will be built"
            );
        }

        let semaphores = setup_semaphores(bootstrap.as_ref(), &host, &ipc, spin_before_yield).await?;

        let scratch_reg = RegisteredMemory::register(scratch, rank, &host, TransportFlags::CUDA_IPC)?;
        let peers: Vec<Rank> = ipc.iter().map(Connection::remote_rank).collect();
        let remote_scratch = exchange_registrations(bootstrap.as_ref(), &scratch_reg, &peers).await?;

        let links = ipc
            .into_iter()
            .zip(semaphores)
            .zip(remote_scratch)
            .map(|((connection, semaphore), remote_scratch)| {
                let scratch_view = connection.map(&remote_scratch)?;
                Ok(PeerLink {
                    connection,
                    semaphore,
                    remote_scratch,
                    scratch_view,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(rank, ipc_peers = links.len(), remote_peers = remote_peers.len(), "fabric connected");

        Ok(Self {
            bootstrap,
            rank,
            host,
            links,
            remote_peers,
        })
    }
}
