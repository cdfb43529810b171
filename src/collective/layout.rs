use crate::device::LANE_BYTES;
use crate::types::Rank;

/// Split of a message into one chunk per rank, in 32-bit lanes.
///
/// Every chunk except possibly the trailing ones holds `chunk_lanes` lanes,
/// a multiple of four so chunk boundaries are 16-byte aligned. Trailing
/// chunks can be short or empty when the message is small.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkLayout {
    pub total_bytes: usize,
    pub total_lanes: usize,
    pub chunk_lanes: usize,
    pub world: usize,
}

impl ChunkLayout {
    pub(crate) fn new(total_bytes: usize, world: usize) -> Self {
        let total_lanes = total_bytes.div_ceil(LANE_BYTES);
        let chunk_lanes = total_lanes.div_ceil(world.max(1)).next_multiple_of(4);
        Self {
            total_bytes,
            total_lanes,
            chunk_lanes,
            world,
        }
    }

    /// First lane of chunk `idx`.
    pub(crate) fn lane_offset(&self, idx: usize) -> usize {
        (idx * self.chunk_lanes).min(self.total_lanes)
    }

    /// Lanes in chunk `idx`; zero for chunks past the end of the data.
    pub(crate) fn chunk_lane_count(&self, idx: usize) -> usize {
        (self.lane_offset(idx) + self.chunk_lanes).min(self.total_lanes) - self.lane_offset(idx)
    }

    /// Byte offset and byte length of chunk `idx`.
    pub(crate) fn byte_range(&self, idx: usize) -> (usize, usize) {
        let start = self.lane_offset(idx) * LANE_BYTES;
        let end = ((self.lane_offset(idx) + self.chunk_lane_count(idx)) * LANE_BYTES).min(self.total_bytes);
        (start, end.saturating_sub(start))
    }
}

/// Rank of the peer in round-robin slot `slot`, skipping `rank` itself.
#[inline]
pub(crate) fn peer_of_slot(slot: usize, rank: Rank) -> Rank {
    let slot = slot as Rank;
    if slot < rank { slot } else { slot + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let l = ChunkLayout::new(64, 4);
        assert_eq!(l.chunk_lanes, 4);
        for c in 0..4 {
            assert_eq!(l.byte_range(c), (c * 16, 16));
        }
    }

    #[test]
    fn test_odd_f16_count_trailing_chunks() {
        // 5 f16 = 10 bytes = 3 lanes; chunk lanes rounds up to 4.
        let l = ChunkLayout::new(10, 4);
        assert_eq!(l.total_lanes, 3);
        assert_eq!(l.chunk_lanes, 4);
        assert_eq!(l.byte_range(0), (0, 10));
        assert_eq!(l.chunk_lane_count(1), 0);
        assert_eq!(l.byte_range(3).1, 0);
    }

    #[test]
    fn test_chunks_cover_message() {
        for (bytes, world) in [(4097 * 4, 8), (4097 * 2, 3), (1, 2), (1 << 20, 8)] {
            let l = ChunkLayout::new(bytes, world);
            let mut next = 0;
            for c in 0..world {
                let (start, len) = l.byte_range(c);
                if len > 0 {
                    assert_eq!(start, next);
                    assert_eq!(start % 16, 0);
                    next = start + len;
                }
            }
            assert_eq!(next, bytes);
        }
    }

    #[test]
    fn test_peer_of_slot() {
        assert_eq!((0..3).map(|s| peer_of_slot(s, 0)).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!((0..3).map(|s| peer_of_slot(s, 2)).collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!((0..3).map(|s| peer_of_slot(s, 3)).collect::<Vec<_>>(), vec![0, 1, 2]);
    }
}
