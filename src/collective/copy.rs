use crate::device::{DeviceBuffer, Kernel, ThreadIdx, copy_region};

/// Device-to-device copy over the whole grid.
///
/// Used for single-rank groups, where every collective reduces to moving the
/// send buffer into the result buffer.
pub(crate) struct CopyKernel {
    src: DeviceBuffer,
    src_offset: usize,
    dst: DeviceBuffer,
    dst_offset: usize,
    bytes: usize,
}

impl CopyKernel {
    pub(crate) fn new(src: DeviceBuffer, src_offset: usize, dst: DeviceBuffer, dst_offset: usize, bytes: usize) -> Self {
        Self {
            src,
            src_offset,
            dst,
            dst_offset,
            bytes,
        }
    }
}

impl Kernel for CopyKernel {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn phases(&self) -> usize {
        1
    }

    fn run(&self, _phase: usize, t: &ThreadIdx) {
        if self.src.same_allocation(&self.dst) && self.src_offset == self.dst_offset {
            return;
        }
        copy_region(
            &self.dst,
            self.dst_offset,
            &self.src,
            self.src_offset,
            self.bytes,
            t.global(),
            t.grid_threads(),
        );
    }
}
