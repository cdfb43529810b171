//! Validation and algorithm selection for the collective entry points.

use std::sync::Arc;

use super::allgather::AllGather;
use super::allreduce::BulkAllReduce;
use super::copy::CopyKernel;
use super::layout::ChunkLayout;
use super::packet::{self, PacketAllReduce};
use crate::channel::{ChannelKey, ChannelPath, ChannelPurpose};
use crate::comm::Communicator;
use crate::device::{DeviceBuffer, Kernel, LaunchConfig, Stream};
use crate::error::{IpcError, Result};
use crate::reduce::{F16x2Lane, F32Lane, I32Lane, Lane, LaneKind};
use crate::types::{DataType, ReduceOp};

/// Algorithm chosen for one all-reduce call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllReducePath {
    /// Single rank: copy send into recv.
    Copy,
    /// Small message: flag-tagged packets through scratch.
    Packet,
    /// Large message: direct reads of peer buffers.
    Bulk,
}

/// Pick the all-reduce algorithm for a message of `bytes`.
///
/// Messages up to `small_msg_bytes` use packets as long as the double
/// buffered packet regions fit into scratch.
pub(crate) fn select_all_reduce_path(comm: &Communicator, bytes: usize) -> AllReducePath {
    if comm.world_size == 1 {
        return AllReducePath::Copy;
    }
    if bytes > comm.config.small_msg_bytes {
        return AllReducePath::Bulk;
    }
    let layout = ChunkLayout::new(bytes, comm.world_size as usize);
    let needed = packet::scratch_bytes(&layout);
    if needed > comm.scratch.len() {
        tracing::warn!(
            rank = comm.rank,
            bytes,
            needed,
            scratch = comm.scratch.len(),
            "packet scratch too small, using bulk all-reduce"
        );
        return AllReducePath::Bulk;
    }
    AllReducePath::Packet
}

fn check_buffer(
    comm: &Communicator,
    operation: &'static str,
    buf: &DeviceBuffer,
    needed: usize,
) -> Result<()> {
    if buf.device() != comm.device.ordinal() {
        return Err(IpcError::DeviceMismatch {
            buffer_device: buf.device(),
            comm_device: comm.device.ordinal(),
        });
    }
    if buf.len() < needed {
        return Err(IpcError::BufferTooSmall {
            operation,
            needed,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn check_call(comm: &Communicator, operation: &'static str, count: usize, stream: &Stream) -> Result<()> {
    if count == 0 {
        return Err(IpcError::invalid(format!("{operation}: element count must be positive")));
    }
    if stream.device() != comm.device.ordinal() {
        return Err(IpcError::DeviceMismatch {
            buffer_device: stream.device(),
            comm_device: comm.device.ordinal(),
        });
    }
    Ok(())
}

/// Byte length of `count` elements of `dtype`, repeated `copies` times.
fn message_bytes(operation: &'static str, count: usize, dtype: DataType, copies: usize) -> Result<usize> {
    count
        .checked_mul(dtype.size_in_bytes())
        .and_then(|b| b.checked_mul(copies))
        .ok_or_else(|| {
            IpcError::invalid(format!(
                "{operation}: {count} {dtype} elements overflow the address space"
            ))
        })
}

/// Round the packet grid down to whole groups of blocks per peer.
fn packet_launch(base: LaunchConfig, n_peers: usize) -> LaunchConfig {
    let n = n_peers.max(1);
    LaunchConfig::new((base.blocks / n).max(1) * n, base.threads)
}

fn lane_kernel<K>(lane: LaneKind, make: K) -> Arc<dyn Kernel>
where
    K: LaneKernelFactory,
{
    match lane {
        LaneKind::I32 => make.build::<I32Lane>(),
        LaneKind::F32 => make.build::<F32Lane>(),
        LaneKind::F16x2 => make.build::<F16x2Lane>(),
    }
}

/// Builds a kernel generic over the lane type once the type is known.
trait LaneKernelFactory {
    fn build<L: Lane>(self) -> Arc<dyn Kernel>;
}

struct PacketFactory<'a> {
    comm: &'a Communicator,
    layout: ChunkLayout,
    table: Arc<crate::channel::ChannelTable>,
    send: &'a DeviceBuffer,
    recv: &'a DeviceBuffer,
}

impl LaneKernelFactory for PacketFactory<'_> {
    fn build<L: Lane>(self) -> Arc<dyn Kernel> {
        Arc::new(PacketAllReduce::<L>::new(
            self.comm.rank,
            self.layout,
            self.table,
            self.send.clone(),
            self.recv.clone(),
            self.comm.scratch.clone(),
            Arc::clone(&self.comm.generation),
            self.comm.topology.is_single_node(),
            self.comm.config.spin_before_yield,
        ))
    }
}

struct BulkFactory<'a> {
    comm: &'a Communicator,
    layout: ChunkLayout,
    table: Arc<crate::channel::ChannelTable>,
    send: &'a DeviceBuffer,
    recv: &'a DeviceBuffer,
    launch: LaunchConfig,
}

impl LaneKernelFactory for BulkFactory<'_> {
    fn build<L: Lane>(self) -> Arc<dyn Kernel> {
        Arc::new(BulkAllReduce::<L>::new(
            self.comm.rank,
            self.layout,
            self.table,
            self.send.clone(),
            self.recv.clone(),
            self.launch.total_threads(),
            self.comm.config.platform.warp_size(),
        ))
    }
}

/// Validate an all-reduce call, pick its path and enqueue it on `stream`.
pub(crate) async fn all_reduce(
    comm: &Communicator,
    send: &DeviceBuffer,
    recv: &DeviceBuffer,
    count: usize,
    dtype: DataType,
    op: ReduceOp,
    stream: &Stream,
) -> Result<()> {
    if op != ReduceOp::Sum {
        return Err(IpcError::UnsupportedOp { op });
    }
    let lane = LaneKind::for_dtype(dtype)?;
    check_call(comm, "allreduce", count, stream)?;
    let bytes = message_bytes("allreduce", count, dtype, 1)?;
    check_buffer(comm, "allreduce", send, bytes)?;
    check_buffer(comm, "allreduce", recv, bytes)?;

    let warp = comm.config.platform.warp_size();
    let path = select_all_reduce_path(comm, bytes);
    tracing::trace!(rank = comm.rank, bytes, %dtype, ?path, "allreduce");

    match path {
        AllReducePath::Copy => stream.launch(
            Arc::new(CopyKernel::new(send.clone(), 0, recv.clone(), 0, bytes)),
            comm.config.bulk_launch(),
            warp,
        ),
        AllReducePath::Packet => {
            let key = ChannelKey {
                path: ChannelPath::Packet,
                send: send.id(),
                recv: recv.id(),
                bytes,
            };
            let table = {
                let mut registry = comm.registry.lock().await;
                registry
                    .acquire(&comm.fabric, key, send, ChannelPurpose::Send)
                    .await?
            };
            let table = comm.constant_bank.publish(key, &table)?;
            let launch = packet_launch(comm.config.packet_launch(), table.send.len());
            let layout = ChunkLayout::new(bytes, comm.world_size as usize);
            let kernel = lane_kernel(
                lane,
                PacketFactory {
                    comm,
                    layout,
                    table,
                    send,
                    recv,
                },
            );
            stream.launch(kernel, launch, warp)
        }
        AllReducePath::Bulk => {
            if !comm.topology.is_single_node() {
                return Err(IpcError::Unimplemented {
                    operation: "bulk allreduce across hosts",
                });
            }
            let key = ChannelKey {
                path: ChannelPath::Bulk,
                send: send.id(),
                recv: recv.id(),
                bytes,
            };
            let table = {
                let mut registry = comm.registry.lock().await;
                let mut table = registry
                    .acquire(&comm.fabric, key, send, ChannelPurpose::Send)
                    .await?;
                if !send.same_allocation(recv) {
                    table = registry
                        .acquire(&comm.fabric, key, recv, ChannelPurpose::Output)
                        .await?;
                }
                table
            };
            let table = comm.constant_bank.publish(key, &table)?;
            let launch = comm.config.bulk_launch();
            let layout = ChunkLayout::new(bytes, comm.world_size as usize);
            let kernel = lane_kernel(
                lane,
                BulkFactory {
                    comm,
                    layout,
                    table,
                    send,
                    recv,
                    launch,
                },
            );
            stream.launch(kernel, launch, warp)
        }
    }
}

/// Validate an all-gather call and enqueue it on `stream`.
///
/// `recv` receives `count` elements from each rank, in rank order.
pub(crate) async fn all_gather(
    comm: &Communicator,
    send: &DeviceBuffer,
    recv: &DeviceBuffer,
    count: usize,
    dtype: DataType,
    stream: &Stream,
) -> Result<()> {
    check_call(comm, "allgather", count, stream)?;
    let bytes = message_bytes("allgather", count, dtype, 1)?;
    let world = comm.world_size as usize;
    let total = message_bytes("allgather", count, dtype, world)?;
    check_buffer(comm, "allgather", send, bytes)?;
    check_buffer(comm, "allgather", recv, total)?;

    let warp = comm.config.platform.warp_size();
    let launch = comm.config.bulk_launch();
    tracing::trace!(rank = comm.rank, bytes, %dtype, "allgather");

    if world == 1 {
        return stream.launch(
            Arc::new(CopyKernel::new(send.clone(), 0, recv.clone(), 0, bytes)),
            launch,
            warp,
        );
    }
    if !comm.topology.is_single_node() {
        return Err(IpcError::Unimplemented {
            operation: "allgather across hosts",
        });
    }

    let key = ChannelKey {
        path: ChannelPath::Gather,
        send: send.id(),
        recv: recv.id(),
        bytes,
    };
    let table = {
        let mut registry = comm.registry.lock().await;
        registry
            .acquire(&comm.fabric, key, recv, ChannelPurpose::Send)
            .await?
    };
    let table = comm.constant_bank.publish(key, &table)?;
    let kernel = AllGather::new(
        comm.rank,
        bytes,
        table,
        send.clone(),
        recv.clone(),
        launch.total_threads(),
        warp,
    );
    stream.launch(Arc::new(kernel), launch, warp)
}
