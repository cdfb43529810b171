//! Building blocks shared by the bulk kernels.

use crate::channel::DeviceChannel;
use crate::device::ThreadIdx;
use crate::types::Rank;

use super::layout::peer_of_slot;

/// Peer slots this thread drives during a handshake.
///
/// Lane 0 of global warp `w` owns slots `w, w + warps, ...`, so every peer
/// gets exactly one signal and one wait per handshake.
fn handshake_slots(t: &ThreadIdx, n_peers: usize) -> impl Iterator<Item = usize> {
    let first = if t.lane() == 0 { t.global_warp() } else { n_peers };
    (first..n_peers).step_by(t.grid_warps().max(1))
}

/// First half of a handshake: tell every peer this rank has arrived.
pub(crate) fn handshake_signal(t: &ThreadIdx, channels: &[DeviceChannel]) {
    for slot in handshake_slots(t, channels.len()) {
        channels[slot].relaxed_signal();
    }
}

/// Like [`handshake_signal`], but fenced so that every prior read of peer
/// memory by this grid completes before the peer may overwrite it.
pub(crate) fn handshake_release(t: &ThreadIdx, channels: &[DeviceChannel]) {
    for slot in handshake_slots(t, channels.len()) {
        channels[slot].signal();
    }
}

/// Second half of a handshake: wait until every peer has arrived.
pub(crate) fn handshake_wait(t: &ThreadIdx, channels: &[DeviceChannel]) {
    for slot in handshake_slots(t, channels.len()) {
        channels[slot].wait();
    }
}

/// Bytes each thread moves per unit once the message is large enough.
const LARGE_UNIT_BYTES: usize = 64;

/// Bytes each thread moves per unit for smaller messages.
const SMALL_UNIT_BYTES: usize = 16;

/// Work split of a round-robin pull from all peers.
///
/// The pull is cut into warp-sized units. Unit `g` belongs to peer slot
/// `g % n_peers` at offset `(g / n_peers) * unit` within that peer's region.
/// Warp `w` handles units `w, w + warps, ...`: all whole rounds first, then
/// one partial round for the units left over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PullPlan {
    /// Bytes one warp moves per unit.
    pub unit_bytes: usize,
    /// Rounds in which every warp has a unit.
    pub full_rounds: usize,
    /// Units in the final partial round.
    pub remainder: usize,
    pub region_bytes: usize,
    pub n_peers: usize,
}

impl PullPlan {
    pub(crate) fn new(region_bytes: usize, n_peers: usize, grid_threads: usize, warp_size: usize) -> Self {
        let per_thread = if region_bytes * n_peers >= grid_threads * LARGE_UNIT_BYTES {
            LARGE_UNIT_BYTES
        } else {
            SMALL_UNIT_BYTES
        };
        let unit_bytes = per_thread * warp_size;
        let warps = (grid_threads / warp_size).max(1);
        let units = n_peers * region_bytes.div_ceil(unit_bytes);
        Self {
            unit_bytes,
            full_rounds: units / warps,
            remainder: units % warps,
            region_bytes,
            n_peers,
        }
    }

    /// Units handled by global warp `warp` of `warps`, as
    /// `(peer slot, offset in region, length)`.
    pub(crate) fn units(&self, warp: usize, warps: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let rounds = self.full_rounds + usize::from(warp < self.remainder);
        (0..rounds).filter_map(move |i| {
            let g = warp + i * warps;
            let slot = g % self.n_peers;
            let offset = (g / self.n_peers) * self.unit_bytes;
            let len = self.unit_bytes.min(self.region_bytes.saturating_sub(offset));
            (len > 0).then_some((slot, offset, len))
        })
    }
}

/// Pull each peer's region into the same range of the local buffer.
///
/// `region(peer)` gives the byte offset and length of the data to take from
/// `peer`; `plan` must have been built with the largest region length.
/// `channels[slot]` must lead to `peer_of_slot(slot, rank)`.
pub(crate) fn pull_round_robin(
    t: &ThreadIdx,
    plan: &PullPlan,
    rank: Rank,
    channels: &[DeviceChannel],
    region: impl Fn(Rank) -> (usize, usize),
) {
    let warps = t.grid_warps().max(1);
    for (slot, offset, len) in plan.units(t.global_warp(), warps) {
        let peer = peer_of_slot(slot, rank);
        debug_assert_eq!(channels[slot].peer(), peer);
        let (base, peer_len) = region(peer);
        let len = len.min(peer_len.saturating_sub(offset));
        if len > 0 {
            channels[slot].get(base + offset, len, t.lane(), t.warp_size);
        }
    }
}
