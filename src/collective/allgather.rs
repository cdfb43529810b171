//! All-gather by direct pulls from same-host peers.
//!
//! Each rank first places its own contribution in its slot of the result
//! buffer, then, after a handshake, reads every peer's slot straight out of
//! that peer's result buffer.

use std::sync::Arc;

use super::bulk::{PullPlan, handshake_release, handshake_signal, handshake_wait, pull_round_robin};
use crate::channel::ChannelTable;
use crate::device::{DeviceBuffer, Kernel, PhaseSync, ThreadIdx, copy_region};
use crate::types::Rank;

const LOCAL_COPY: usize = 0;
const ENTRY_SIGNAL: usize = 1;
const ENTRY_WAIT: usize = 2;
const PULL: usize = 3;
const EXIT_SIGNAL: usize = 4;
const EXIT_WAIT: usize = 5;

pub(crate) struct AllGather {
    rank: Rank,
    bytes_per_rank: usize,
    table: Arc<ChannelTable>,
    send: DeviceBuffer,
    recv: DeviceBuffer,
    plan: PullPlan,
}

impl AllGather {
    pub(crate) fn new(
        rank: Rank,
        bytes_per_rank: usize,
        table: Arc<ChannelTable>,
        send: DeviceBuffer,
        recv: DeviceBuffer,
        grid_threads: usize,
        warp_size: usize,
    ) -> Self {
        let plan = PullPlan::new(bytes_per_rank, table.send.len(), grid_threads, warp_size);
        Self {
            rank,
            bytes_per_rank,
            table,
            send,
            recv,
            plan,
        }
    }
}

impl Kernel for AllGather {
    fn name(&self) -> &'static str {
        "allgather"
    }

    fn phases(&self) -> usize {
        EXIT_WAIT + 1
    }

    fn sync_after(&self, phase: usize) -> PhaseSync {
        match phase {
            LOCAL_COPY | ENTRY_WAIT | PULL => PhaseSync::Grid,
            _ => PhaseSync::Block,
        }
    }

    fn run(&self, phase: usize, t: &ThreadIdx) {
        let channels = &self.table.send;
        match phase {
            // A send buffer that is the result buffer already holds the
            // contribution in its slot.
            LOCAL_COPY if !self.send.same_allocation(&self.recv) => copy_region(
                &self.recv,
                self.rank as usize * self.bytes_per_rank,
                &self.send,
                0,
                self.bytes_per_rank,
                t.global(),
                t.grid_threads(),
            ),
            ENTRY_SIGNAL => handshake_signal(t, channels),
            EXIT_SIGNAL => handshake_release(t, channels),
            ENTRY_WAIT | EXIT_WAIT => handshake_wait(t, channels),
            PULL => pull_round_robin(t, &self.plan, self.rank, channels, |peer| {
                (peer as usize * self.bytes_per_rank, self.bytes_per_rank)
            }),
            _ => {}
        }
    }
}
