use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use crate::channel::{ChannelRegistry, ConstantBank, Fabric};
use crate::collective::{self, AllReducePath};
use crate::config::IpcConfig;
use crate::device::{Device, DeviceBuffer, Stream};
use crate::error::{IpcError, Result};
use crate::topology::{NodeTopology, discover_topology};
use crate::transport::{Bootstrap, LocalBootstrap, UniqueId};
use crate::types::{DataType, Rank, ReduceOp};

/// One rank's membership in a collective group.
///
/// Holds the rank's connections, semaphores and scratch memory, plus the
/// cache of channel sets built for the buffers it has been called with.
/// Collective calls enqueue device work on the caller's stream and return;
/// call [`Stream::synchronize`] to wait for the result.
pub struct Communicator {
    pub(crate) rank: Rank,
    pub(crate) world_size: u32,
    pub(crate) config: IpcConfig,
    pub(crate) device: Device,
    pub(crate) topology: NodeTopology,
    pub(crate) fabric: Fabric,
    /// Landing area for the packet protocol; peers write into it.
    pub(crate) scratch: DeviceBuffer,
    pub(crate) registry: Mutex<ChannelRegistry>,
    pub(crate) constant_bank: ConstantBank,
    /// Generation of the last packet all-reduce, advanced by the kernel.
    pub(crate) generation: Arc<AtomicU64>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank)
            .field("world_size", &self.world_size)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    /// Join the group named by `id` as `rank` on `device`.
    ///
    /// Every rank of the group must call this concurrently with the same
    /// `id` and `world_size`.
    pub async fn init_rank(
        world_size: u32,
        id: &UniqueId,
        rank: Rank,
        device: Device,
        config: IpcConfig,
    ) -> Result<Self> {
        let bootstrap = LocalBootstrap::join(id, rank, world_size, config.bootstrap_timeout)?;
        Self::init_with_bootstrap(Arc::new(bootstrap), device, config).await
    }

    /// Set up a rank over an existing bootstrap.
    ///
    /// Discovers the host layout, connects to every peer, creates one
    /// semaphore per same-host peer and exchanges scratch buffers with them.
    pub async fn init_with_bootstrap(
        bootstrap: Arc<dyn Bootstrap>,
        device: Device,
        config: IpcConfig,
    ) -> Result<Self> {
        if config.scratch_bytes == 0 {
            return Err(IpcError::invalid("scratch_bytes must be positive"));
        }
        let rank = bootstrap.rank();
        let world_size = bootstrap.world_size();

        let topology = discover_topology(bootstrap.as_ref(), device.host()).await?;
        let scratch = device.alloc(config.scratch_bytes)?;
        let fabric = Fabric::connect(
            Arc::clone(&bootstrap),
            &topology,
            &scratch,
            config.spin_before_yield,
        )
        .await?;
        bootstrap.barrier().await?;

        tracing::debug!(
            rank,
            world_size,
            device = device.ordinal(),
            host = %topology.hostname,
            ranks_per_node = topology.local_world_size(),
            remote_peers = fabric.remote_peers.len(),
            platform = %config.platform,
            "communicator initialized"
        );

        Ok(Self {
            rank,
            world_size,
            config,
            device,
            topology,
            fabric,
            scratch,
            registry: Mutex::new(ChannelRegistry::new()),
            constant_bank: ConstantBank::new(),
            generation: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create a complete in-process group of `world_size` ranks, rank `i`
    /// on device `i` of this host.
    pub async fn bootstrap_local(world_size: u32, config: IpcConfig) -> Result<Vec<Self>> {
        let devices = (0..world_size).map(Device::new).collect();
        Self::bootstrap_local_on(devices, config).await
    }

    /// Create an in-process group with one rank per entry of `devices`.
    pub async fn bootstrap_local_on(devices: Vec<Device>, config: IpcConfig) -> Result<Vec<Self>> {
        let world_size = devices.len() as u32;
        let group = LocalBootstrap::local_group(world_size, config.bootstrap_timeout)?;
        let inits = group.into_iter().zip(devices).map(|(bootstrap, device)| {
            Self::init_with_bootstrap(Arc::new(bootstrap), device, config.clone())
        });
        futures::future::try_join_all(inits).await
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }

    /// Number of ranks that share this rank's host.
    pub fn n_ranks_per_node(&self) -> usize {
        self.topology.local_world_size()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &IpcConfig {
        &self.config
    }

    pub fn topology(&self) -> &NodeTopology {
        &self.topology
    }

    pub fn is_single_node(&self) -> bool {
        self.topology.is_single_node()
    }

    /// Stream on this communicator's device.
    pub fn create_stream(&self) -> Result<Stream> {
        Stream::new(&self.device)
    }

    /// Number of distinct channel sets built so far.
    pub async fn cached_channel_sets(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Generation counter of the packet protocol.
    pub fn packet_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Algorithm an all-reduce of `bytes` would use.
    pub fn all_reduce_path(&self, bytes: usize) -> AllReducePath {
        collective::select_all_reduce_path(self, bytes)
    }

    /// Sum `count` elements of `send` across all ranks into `recv`.
    ///
    /// `send` and `recv` may be the same buffer. Only `ReduceOp::Sum` over
    /// `F16`, `F32` and `I32` is supported.
    pub async fn all_reduce(
        &self,
        send: &DeviceBuffer,
        recv: &DeviceBuffer,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        stream: &Stream,
    ) -> Result<()> {
        collective::all_reduce(self, send, recv, count, dtype, op, stream).await
    }

    /// Concatenate `count` elements from every rank into `recv`, in rank
    /// order. `recv` must hold `count * world_size` elements.
    pub async fn all_gather(
        &self,
        send: &DeviceBuffer,
        recv: &DeviceBuffer,
        count: usize,
        dtype: DataType,
        stream: &Stream,
    ) -> Result<()> {
        collective::all_gather(self, send, recv, count, dtype, stream).await
    }

    pub async fn send(
        &self,
        _buf: &DeviceBuffer,
        _count: usize,
        _dtype: DataType,
        _peer: Rank,
        _stream: &Stream,
    ) -> Result<()> {
        Err(IpcError::Unimplemented { operation: "send" })
    }

    pub async fn recv(
        &self,
        _buf: &DeviceBuffer,
        _count: usize,
        _dtype: DataType,
        _peer: Rank,
        _stream: &Stream,
    ) -> Result<()> {
        Err(IpcError::Unimplemented { operation: "recv" })
    }

    pub async fn broadcast(
        &self,
        _send: &DeviceBuffer,
        _recv: &DeviceBuffer,
        _count: usize,
        _dtype: DataType,
        _root: Rank,
        _stream: &Stream,
    ) -> Result<()> {
        Err(IpcError::Unimplemented {
            operation: "broadcast",
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn reduce(
        &self,
        _send: &DeviceBuffer,
        _recv: &DeviceBuffer,
        _count: usize,
        _dtype: DataType,
        _op: ReduceOp,
        _root: Rank,
        _stream: &Stream,
    ) -> Result<()> {
        Err(IpcError::Unimplemented { operation: "reduce" })
    }

    pub async fn reduce_scatter(
        &self,
        _send: &DeviceBuffer,
        _recv: &DeviceBuffer,
        _recv_count: usize,
        _dtype: DataType,
        _op: ReduceOp,
        _stream: &Stream,
    ) -> Result<()> {
        Err(IpcError::Unimplemented {
            operation: "reduce_scatter",
        })
    }

    pub async fn split(&self, _color: i32, _key: i32) -> Result<Communicator> {
        Err(IpcError::Unimplemented { operation: "split" })
    }

    pub fn create_custom_reduce_op(&self, _dtype: DataType) -> Result<ReduceOp> {
        Err(IpcError::Unimplemented {
            operation: "custom reduce operators",
        })
    }

    /// Grouping has no effect: every call is enqueued immediately.
    pub fn group_start(&self) -> Result<()> {
        Ok(())
    }

    pub fn group_end(&self) -> Result<()> {
        Ok(())
    }

    /// Leave the group once every rank has reached this point.
    pub async fn destroy(self) -> Result<()> {
        self.fabric.bootstrap.barrier().await?;
        tracing::debug!(rank = self.rank, "communicator destroyed");
        Ok(())
    }
}
