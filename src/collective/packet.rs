//! Low-latency all-reduce over flag-tagged packets.
//!
//! Each rank owns one chunk of the message. Ranks push their copy of every
//! peer's chunk into that peer's scratch as packets (reduce-scatter), reduce
//! their own chunk, then push the result to every peer's scratch (all-gather).
//! Readers poll packet flags instead of waiting on semaphores.
//!
//! Scratch is split into two halves selected by the call's generation
//! parity, so packets of consecutive calls never share slots. Each half has a
//! reduce-scatter region and an all-gather region with one slot per source
//! rank.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::layout::ChunkLayout;
use crate::channel::{ChannelTable, PACKET_BYTES, flag_for, read_packet};
use crate::device::{DeviceBuffer, Kernel, ThreadIdx};
use crate::reduce::{Lane, add_vec2};
use crate::types::Rank;

const STAGE_REDUCE_SCATTER: usize = 0;
const STAGE_ALL_GATHER: usize = 1;

/// Packets of scratch one call needs, across both halves.
pub(crate) fn scratch_packets(layout: &ChunkLayout) -> usize {
    2 * 2 * layout.world * layout.chunk_lanes
}

/// Bytes of scratch one call needs.
pub(crate) fn scratch_bytes(layout: &ChunkLayout) -> usize {
    scratch_packets(layout) * PACKET_BYTES
}

/// Peer a block serves in the per-peer phases, with the thread's index and
/// stride among all threads serving that peer.
fn peer_assignment(t: &ThreadIdx, n_peers: usize) -> Option<(usize, usize, usize)> {
    let per_peer = t.grid_dim / n_peers.max(1);
    if n_peers == 0 || per_peer == 0 || t.block >= per_peer * n_peers {
        return None;
    }
    let slot = t.block / per_peer;
    let tid = (t.block % per_peer) * t.block_dim + t.thread;
    Some((slot, tid, per_peer * t.block_dim))
}

pub(crate) struct PacketAllReduce<L: Lane> {
    rank: Rank,
    layout: ChunkLayout,
    table: Arc<ChannelTable>,
    send: DeviceBuffer,
    recv: DeviceBuffer,
    scratch: DeviceBuffer,
    generation: Arc<AtomicU64>,
    /// Generation of this launch, fixed in `prepare`.
    epoch: AtomicU64,
    active: bool,
    spin_before_yield: u32,
    _lane: PhantomData<L>,
}

impl<L: Lane> PacketAllReduce<L> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rank: Rank,
        layout: ChunkLayout,
        table: Arc<ChannelTable>,
        send: DeviceBuffer,
        recv: DeviceBuffer,
        scratch: DeviceBuffer,
        generation: Arc<AtomicU64>,
        active: bool,
        spin_before_yield: u32,
    ) -> Self {
        debug_assert!(!active || scratch.len() >= scratch_bytes(&layout));
        Self {
            rank,
            layout,
            table,
            send,
            recv,
            scratch,
            generation,
            epoch: AtomicU64::new(0),
            active,
            spin_before_yield,
            _lane: PhantomData,
        }
    }

    /// First packet of the slot written by `src` in `stage` of half `parity`.
    fn slot(&self, parity: usize, stage: usize, src: usize) -> usize {
        let region = self.layout.world * self.layout.chunk_lanes;
        parity * 2 * region + stage * region + src * self.layout.chunk_lanes
    }

    fn epoch(&self) -> (u32, usize) {
        let epoch = self.epoch.load(Ordering::Relaxed);
        (flag_for(epoch), (epoch % 2) as usize)
    }

    fn scatter(&self, t: &ThreadIdx) {
        let (flag, parity) = self.epoch();
        if let Some((slot, tid, stride)) = peer_assignment(t, self.table.send.len()) {
            let ch = &self.table.send[slot];
            let peer = ch.peer() as usize;
            let off = self.layout.lane_offset(peer);
            let base = self.slot(parity, STAGE_REDUCE_SCATTER, self.rank as usize);
            for i in (tid..self.layout.chunk_lane_count(peer)).step_by(stride) {
                ch.put_packet(base + i, self.send.load(off + i), flag);
            }
        }
        if t.block == 0 && t.thread == 0 {
            self.generation
                .store(self.epoch.load(Ordering::Relaxed), Ordering::Release);
        }
    }

    /// Sum this rank's chunk, two lanes per thread, and publish the result.
    fn reduce(&self, t: &ThreadIdx) {
        let (flag, parity) = self.epoch();
        let rank = self.rank as usize;
        let off = self.layout.lane_offset(rank);
        let lanes = self.layout.chunk_lane_count(rank);
        let (start, len) = self.layout.byte_range(rank);
        let out = self.recv.slice(start, len);
        let gather_base = self.slot(parity, STAGE_ALL_GATHER, rank);

        for pair in (t.global()..lanes.div_ceil(2)).step_by(t.grid_threads()) {
            let i = pair * 2;
            let width = (lanes - i).min(2);
            let mut acc = [0u32; 2];
            for (k, a) in acc.iter_mut().enumerate().take(width) {
                *a = self.send.load(off + i + k);
            }
            for ch in &self.table.send {
                let src = self.slot(parity, STAGE_REDUCE_SCATTER, ch.peer() as usize) + i;
                let mut v = [0u32; 2];
                for (k, x) in v.iter_mut().enumerate().take(width) {
                    *x = read_packet(&self.scratch, src + k, flag, self.spin_before_yield);
                }
                acc = add_vec2::<L>(acc, v);
            }
            for (k, &a) in acc.iter().enumerate().take(width) {
                out.store(i + k, a);
                for ch in &self.table.send {
                    ch.put_packet(gather_base + i + k, a, flag);
                }
            }
        }
    }

    fn gather(&self, t: &ThreadIdx) {
        let (flag, parity) = self.epoch();
        let Some((slot, tid, stride)) = peer_assignment(t, self.table.send.len()) else {
            return;
        };
        let peer = self.table.send[slot].peer() as usize;
        let (start, len) = self.layout.byte_range(peer);
        let out = self.recv.slice(start, len);
        let base = self.slot(parity, STAGE_ALL_GATHER, peer);
        for i in (tid..self.layout.chunk_lane_count(peer)).step_by(stride) {
            out.store(i, read_packet(&self.scratch, base + i, flag, self.spin_before_yield));
        }
    }
}

impl<L: Lane> Kernel for PacketAllReduce<L> {
    fn name(&self) -> &'static str {
        "allreduce-packet"
    }

    fn phases(&self) -> usize {
        3
    }

    fn prepare(&self) {
        if self.active {
            let next = self.generation.load(Ordering::Acquire) + 1;
            self.epoch.store(next, Ordering::Relaxed);
        }
    }

    fn run(&self, phase: usize, t: &ThreadIdx) {
        if !self.active {
            return;
        }
        match phase {
            0 => self.scatter(t),
            1 => self.reduce(t),
            _ => self.gather(t),
        }
    }
}
