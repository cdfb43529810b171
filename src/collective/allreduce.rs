//! Bandwidth-oriented all-reduce for large messages.
//!
//! After an entry handshake every rank sums its own chunk by reading the
//! matching chunk of each peer's send buffer directly. A second handshake
//! publishes the reduced chunks, which every rank then pulls from its peers'
//! result buffers. An exit handshake keeps any rank from reusing its
//! buffers while a peer is still reading them.

use std::marker::PhantomData;
use std::sync::Arc;

use super::bulk::{PullPlan, handshake_release, handshake_signal, handshake_wait, pull_round_robin};
use super::layout::ChunkLayout;
use crate::channel::ChannelTable;
use crate::device::{DeviceBuffer, Kernel, LANE_BYTES, PhaseSync, ThreadIdx, copy_region};
use crate::reduce::{Lane, add_assign, add_into};
use crate::types::Rank;

const ENTRY_SIGNAL: usize = 0;
const ENTRY_WAIT: usize = 1;
const REDUCE: usize = 2;
const PUBLISH_SIGNAL: usize = 3;
const PUBLISH_WAIT: usize = 4;
const GATHER: usize = 5;
const EXIT_SIGNAL: usize = 6;
const EXIT_WAIT: usize = 7;

pub(crate) struct BulkAllReduce<L: Lane> {
    rank: Rank,
    layout: ChunkLayout,
    table: Arc<ChannelTable>,
    send: DeviceBuffer,
    recv: DeviceBuffer,
    plan: PullPlan,
    _lane: PhantomData<L>,
}

impl<L: Lane> BulkAllReduce<L> {
    pub(crate) fn new(
        rank: Rank,
        layout: ChunkLayout,
        table: Arc<ChannelTable>,
        send: DeviceBuffer,
        recv: DeviceBuffer,
        grid_threads: usize,
        warp_size: usize,
    ) -> Self {
        let plan = PullPlan::new(
            layout.chunk_lanes * LANE_BYTES,
            table.send.len(),
            grid_threads,
            warp_size,
        );
        Self {
            rank,
            layout,
            table,
            send,
            recv,
            plan,
            _lane: PhantomData,
        }
    }

    fn reduce(&self, t: &ThreadIdx) {
        let (start, len) = self.layout.byte_range(self.rank as usize);
        if len == 0 {
            return;
        }
        let (tid, n) = (t.global(), t.grid_threads());
        let out = self.recv.slice(start, len);
        let own = self.send.slice(start, len);
        match self.table.send.split_first() {
            Some((first, rest)) => {
                add_into::<L>(out, own, first.remote().slice(start, len), tid, n);
                for ch in rest {
                    add_assign::<L>(out, ch.remote().slice(start, len), tid, n);
                }
            }
            None => copy_region(&self.recv, start, &self.send, start, len, tid, n),
        }
    }
}

impl<L: Lane> Kernel for BulkAllReduce<L> {
    fn name(&self) -> &'static str {
        "allreduce-bulk"
    }

    fn phases(&self) -> usize {
        EXIT_WAIT + 1
    }

    fn sync_after(&self, phase: usize) -> PhaseSync {
        match phase {
            ENTRY_WAIT | REDUCE | PUBLISH_WAIT | GATHER => PhaseSync::Grid,
            _ => PhaseSync::Block,
        }
    }

    fn run(&self, phase: usize, t: &ThreadIdx) {
        let channels = &self.table.send;
        match phase {
            ENTRY_SIGNAL | PUBLISH_SIGNAL => handshake_signal(t, channels),
            EXIT_SIGNAL => handshake_release(t, channels),
            ENTRY_WAIT | PUBLISH_WAIT | EXIT_WAIT => handshake_wait(t, channels),
            REDUCE => self.reduce(t),
            GATHER => pull_round_robin(
                t,
                &self.plan,
                self.rank,
                self.table.result_channels(),
                |peer| self.layout.byte_range(peer as usize),
            ),
            _ => {}
        }
    }
}
