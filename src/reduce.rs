//! Vectorized element-wise summation over 32-bit lanes.
//!
//! Device memory is addressed in 32-bit lanes. A lane holds one `i32`, one
//! `f32` or two packed `f16` values; the [`Lane`] implementations add two
//! lanes in the matching interpretation. The slice primitives split work
//! between cooperating threads in 16-byte vectors with a scalar remainder;
//! callers that already work in lane pairs use [`add_vec2`].

use half::f16;

use crate::device::DeviceSlice;
use crate::error::{IpcError, Result};
use crate::types::DataType;

/// Element-wise addition of two 32-bit lanes under one element type.
pub(crate) trait Lane: Copy + Send + Sync + 'static {
    fn add(a: u32, b: u32) -> u32;
}

/// One `i32` per lane, wrapping on overflow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct I32Lane;

/// One `f32` per lane.
#[derive(Debug, Clone, Copy)]
pub(crate) struct F32Lane;

/// Two `f16` per lane, added independently.
#[derive(Debug, Clone, Copy)]
pub(crate) struct F16x2Lane;

impl Lane for I32Lane {
    #[inline]
    fn add(a: u32, b: u32) -> u32 {
        (a as i32).wrapping_add(b as i32) as u32
    }
}

impl Lane for F32Lane {
    #[inline]
    fn add(a: u32, b: u32) -> u32 {
        (f32::from_bits(a) + f32::from_bits(b)).to_bits()
    }
}

impl Lane for F16x2Lane {
    // Each half is rounded once to the nearest f16, matching scalar addition.
    #[inline]
    fn add(a: u32, b: u32) -> u32 {
        let lo = f16::from_bits(a as u16) + f16::from_bits(b as u16);
        let hi = f16::from_bits((a >> 16) as u16) + f16::from_bits((b >> 16) as u16);
        ((hi.to_bits() as u32) << 16) | lo.to_bits() as u32
    }
}

#[inline]
pub(crate) fn add_vec2<L: Lane>(a: [u32; 2], b: [u32; 2]) -> [u32; 2] {
    [L::add(a[0], b[0]), L::add(a[1], b[1])]
}

#[inline]
pub(crate) fn add_vec4<L: Lane>(a: [u32; 4], b: [u32; 4]) -> [u32; 4] {
    [
        L::add(a[0], b[0]),
        L::add(a[1], b[1]),
        L::add(a[2], b[2]),
        L::add(a[3], b[3]),
    ]
}

/// Runtime selector for the [`Lane`] implementation of a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaneKind {
    I32,
    F32,
    F16x2,
}

impl LaneKind {
    /// Lane interpretation for summing `dtype`, if summation is supported.
    pub(crate) fn for_dtype(dtype: DataType) -> Result<Self> {
        match dtype {
            DataType::I32 => Ok(LaneKind::I32),
            DataType::F32 => Ok(LaneKind::F32),
            DataType::F16 => Ok(LaneKind::F16x2),
            _ => Err(IpcError::UnsupportedDType {
                dtype,
                op: "allreduce",
            }),
        }
    }
}

/// `dst[i] += src[i]` over the lanes of `dst`, 16-byte vectors first.
///
/// Thread `tid` of `n_threads` takes every `n_threads`-th vector, then every
/// `n_threads`-th leftover lane. The lane set a thread touches depends only
/// on `(tid, n_threads)` and the slice length.
pub(crate) fn add_assign<L: Lane>(dst: DeviceSlice<'_>, src: DeviceSlice<'_>, tid: usize, n_threads: usize) {
    let lanes = dst.lanes();
    let vecs = lanes / 4;
    for v in (tid..vecs).step_by(n_threads) {
        let i = v * 4;
        dst.store4(i, add_vec4::<L>(dst.load4(i), src.load4(i)));
    }
    for i in (vecs * 4 + tid..lanes).step_by(n_threads) {
        dst.store(i, L::add(dst.load(i), src.load(i)));
    }
}

/// `out[i] = a[i] + b[i]` with the same work split as [`add_assign`].
///
/// `out` may alias `a` or `b`: each lane is read and written by one thread.
pub(crate) fn add_into<L: Lane>(
    out: DeviceSlice<'_>,
    a: DeviceSlice<'_>,
    b: DeviceSlice<'_>,
    tid: usize,
    n_threads: usize,
) {
    let lanes = out.lanes();
    let vecs = lanes / 4;
    for v in (tid..vecs).step_by(n_threads) {
        let i = v * 4;
        out.store4(i, add_vec4::<L>(a.load4(i), b.load4(i)));
    }
    for i in (vecs * 4 + tid..lanes).step_by(n_threads) {
        out.store(i, L::add(a.load(i), b.load(i)));
    }
}
