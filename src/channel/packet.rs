//! Flag-tagged packets for the low-latency protocol.
//!
//! A packet is two 32-bit lanes: a payload lane followed by a flag lane.
//! The writer stores the payload, then publishes the flag with release
//! ordering. A reader that observes the expected flag with acquire ordering
//! is guaranteed to see the matching payload, so no separate
//! synchronization is needed per transfer.

use crate::device::{DeviceBuffer, LANE_BYTES, spin_until};

/// Lanes per packet.
pub(crate) const PACKET_LANES: usize = 2;

/// Bytes per packet.
pub(crate) const PACKET_BYTES: usize = PACKET_LANES * LANE_BYTES;

#[inline]
pub(crate) fn write(buf: &DeviceBuffer, index: usize, data: u32, flag: u32) {
    let lane = index * PACKET_LANES;
    buf.store(lane, data);
    buf.store_release(lane + 1, flag);
}

/// Spin until packet `index` carries `flag`, then return its payload.
#[inline]
pub(crate) fn read(buf: &DeviceBuffer, index: usize, flag: u32, spin_before_yield: u32) -> u32 {
    spin_until(
        || buf.load_acquire(index * PACKET_LANES + 1) == flag,
        spin_before_yield,
    );
    buf.load(index * PACKET_LANES)
}

/// Map a 64-bit generation to a nonzero 32-bit flag.
///
/// Zero is what fresh scratch memory holds, so it must never be a valid flag.
#[inline]
pub(crate) fn flag_for(generation: u64) -> u32 {
    match generation as u32 {
        0 => 1,
        f => f,
    }
}
