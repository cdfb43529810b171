use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{IpcError, Result};
use crate::types::{Element, elements_from_bytes, elements_to_bytes};

/// Width of one addressable memory lane.
pub(crate) const LANE_BYTES: usize = 4;

/// Allocations are padded to whole 16-byte vectors.
const ALIGN_LANES: usize = 4;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a device allocation.
///
/// Ids are never reused, so an id cannot collide with a freed allocation
/// that happened to live at the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

struct Allocation {
    id: BufferId,
    device: u32,
    len: usize,
    lanes: Box<[AtomicU32]>,
}

/// A region of device memory.
///
/// Cloning is cheap and yields another handle to the same allocation. The
/// memory is freed when the last handle (including peer mappings opened
/// through an IPC handle) is dropped.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<Allocation>,
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.inner.id)
            .field("device", &self.inner.device)
            .field("len", &self.inner.len)
            .finish()
    }
}

/// Non-owning reference used by the IPC handle table.
pub(crate) struct WeakBuffer(Weak<Allocation>);

impl WeakBuffer {
    pub(crate) fn upgrade(&self) -> Option<DeviceBuffer> {
        self.0.upgrade().map(|inner| DeviceBuffer { inner })
    }

    pub(crate) fn is_live(&self) -> bool {
        self.0.strong_count() > 0
    }
}

impl DeviceBuffer {
    pub(crate) fn zeroed(device: u32, len: usize) -> Self {
        let lanes = len
            .div_ceil(LANE_BYTES)
            .next_multiple_of(ALIGN_LANES)
            .max(ALIGN_LANES);
        Self {
            inner: Arc::new(Allocation {
                id: BufferId::next(),
                device,
                len,
                lanes: (0..lanes).map(|_| AtomicU32::new(0)).collect(),
            }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    /// Ordinal of the device that owns this memory.
    pub fn device(&self) -> u32 {
        self.inner.device
    }

    /// Usable size in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// True if both handles refer to the same allocation.
    pub fn same_allocation(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakBuffer {
        WeakBuffer(Arc::downgrade(&self.inner))
    }

    /// Lanes backing the allocation, including vector padding.
    pub(crate) fn lane_capacity(&self) -> usize {
        self.inner.lanes.len()
    }

    /// Lane-aligned window of `len` bytes starting at byte `offset`.
    pub(crate) fn slice(&self, offset: usize, len: usize) -> DeviceSlice<'_> {
        debug_assert_eq!(offset % LANE_BYTES, 0, "slice offset must be lane aligned");
        debug_assert!(offset + len <= self.lane_capacity() * LANE_BYTES);
        DeviceSlice {
            buf: self,
            base: offset / LANE_BYTES,
            len,
        }
    }

    pub(crate) fn full(&self) -> DeviceSlice<'_> {
        self.slice(0, self.len())
    }

    #[inline]
    pub(crate) fn load(&self, lane: usize) -> u32 {
        self.inner.lanes[lane].load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store(&self, lane: usize, value: u32) {
        self.inner.lanes[lane].store(value, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn load_acquire(&self, lane: usize) -> u32 {
        self.inner.lanes[lane].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store_release(&self, lane: usize, value: u32) {
        self.inner.lanes[lane].store(value, Ordering::Release);
    }

    /// Replace only the bits selected by `mask`, leaving the rest of the
    /// lane to whoever else owns them.
    #[inline]
    pub(crate) fn store_masked(&self, lane: usize, value: u32, mask: u32) {
        let _ = self.inner.lanes[lane].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
            Some((w & !mask) | (value & mask))
        });
    }

    #[inline]
    pub(crate) fn read_byte(&self, offset: usize) -> u8 {
        (self.load(offset / LANE_BYTES) >> ((offset % LANE_BYTES) * 8)) as u8
    }

    #[inline]
    pub(crate) fn write_byte(&self, offset: usize, byte: u8) {
        let shift = (offset % LANE_BYTES) * 8;
        self.store_masked(offset / LANE_BYTES, (byte as u32) << shift, 0xFF << shift);
    }

    fn check_range(&self, operation: &'static str, offset: usize, len: usize) -> Result<()> {
        let needed = offset
            .checked_add(len)
            .ok_or_else(|| IpcError::invalid(format!("{operation}: range overflows")))?;
        if needed > self.len() {
            return Err(IpcError::BufferTooSmall {
                operation,
                needed,
                actual: self.len(),
            });
        }
        Ok(())
    }

    /// Copy host bytes into the buffer at `offset`.
    ///
    /// Like a synchronous device memcpy: the caller must make sure no kernel
    /// touching this range is still in flight.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range("write_bytes", offset, data.len())?;
        let end = offset + data.len();
        let mut pos = offset;
        while pos < end {
            let lane = pos / LANE_BYTES;
            let lane_start = lane * LANE_BYTES;
            if pos == lane_start && pos + LANE_BYTES <= end {
                let src = &data[pos - offset..pos - offset + LANE_BYTES];
                self.store(lane, u32::from_le_bytes([src[0], src[1], src[2], src[3]]));
                pos += LANE_BYTES;
            } else {
                self.write_byte(pos, data[pos - offset]);
                pos += 1;
            }
        }
        Ok(())
    }

    /// Copy `len` bytes starting at `offset` back to the host.
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_range("read_bytes", offset, len)?;
        let mut out = Vec::with_capacity(len);
        let end = offset + len;
        let mut pos = offset;
        while pos < end {
            let lane = pos / LANE_BYTES;
            let bytes = self.load(lane).to_le_bytes();
            let from = pos - lane * LANE_BYTES;
            let to = (end - lane * LANE_BYTES).min(LANE_BYTES);
            out.extend_from_slice(&bytes[from..to]);
            pos += to - from;
        }
        Ok(out)
    }

    /// Upload typed host values to the start of the buffer.
    pub fn copy_from_host<T: Element>(&self, values: &[T]) -> Result<()> {
        self.write_bytes(0, &elements_to_bytes(values))
    }

    /// Download the first `count` elements of the buffer.
    pub fn to_host<T: Element>(&self, count: usize) -> Result<Vec<T>> {
        let bytes = self.read_bytes(0, count * T::DTYPE.size_in_bytes())?;
        Ok(elements_from_bytes(&bytes))
    }
}

/// Lane-aligned window into a [`DeviceBuffer`], as seen by kernel code.
///
/// Loads may touch padding past `len`; stores never write a byte past `len`.
#[derive(Clone, Copy)]
pub(crate) struct DeviceSlice<'a> {
    buf: &'a DeviceBuffer,
    base: usize,
    len: usize,
}

impl<'a> DeviceSlice<'a> {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Lanes holding at least one byte of the window.
    pub(crate) fn lanes(&self) -> usize {
        self.len.div_ceil(LANE_BYTES)
    }

    #[inline]
    pub(crate) fn load(&self, lane: usize) -> u32 {
        self.buf.load(self.base + lane)
    }

    #[inline]
    pub(crate) fn store(&self, lane: usize, value: u32) {
        let start = lane * LANE_BYTES;
        if start + LANE_BYTES <= self.len {
            self.buf.store(self.base + lane, value);
        } else if start < self.len {
            let mask = (1u32 << ((self.len - start) * 8)) - 1;
            self.buf.store_masked(self.base + lane, value, mask);
        }
    }

    #[inline]
    pub(crate) fn load4(&self, lane: usize) -> [u32; 4] {
        [
            self.load(lane),
            self.load(lane + 1),
            self.load(lane + 2),
            self.load(lane + 3),
        ]
    }

    #[inline]
    pub(crate) fn store4(&self, lane: usize, v: [u32; 4]) {
        for (k, value) in v.into_iter().enumerate() {
            self.store(lane + k, value);
        }
    }
}

/// Copy `len` bytes between two buffers, spreading the work over `n`
/// cooperating threads of which this is thread `tid`.
///
/// Matching misalignment gets a head/tail fixup around a 16-byte vector
/// body; differing misalignment falls back to a bytewise copy.
pub(crate) fn copy_region(
    dst: &DeviceBuffer,
    dst_off: usize,
    src: &DeviceBuffer,
    src_off: usize,
    len: usize,
    tid: usize,
    n: usize,
) {
    if len == 0 {
        return;
    }
    if dst_off % LANE_BYTES != src_off % LANE_BYTES {
        for b in (tid..len).step_by(n) {
            dst.write_byte(dst_off + b, src.read_byte(src_off + b));
        }
        return;
    }

    let head = ((LANE_BYTES - dst_off % LANE_BYTES) % LANE_BYTES).min(len);
    let body = len - head;
    let full_lanes = body / LANE_BYTES;
    let tail = body % LANE_BYTES;

    if tid == 0 {
        for b in 0..head {
            dst.write_byte(dst_off + b, src.read_byte(src_off + b));
        }
        let t0 = head + full_lanes * LANE_BYTES;
        for b in t0..t0 + tail {
            dst.write_byte(dst_off + b, src.read_byte(src_off + b));
        }
    }

    let dl = (dst_off + head) / LANE_BYTES;
    let sl = (src_off + head) / LANE_BYTES;
    let vecs = full_lanes / 4;
    for v in (tid..vecs).step_by(n) {
        for k in 0..4 {
            let lane = v * 4 + k;
            dst.store(dl + lane, src.load(sl + lane));
        }
    }
    for lane in (vecs * 4 + tid..full_lanes).step_by(n) {
        dst.store(dl + lane, src.load(sl + lane));
    }
}
