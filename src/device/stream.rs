use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, watch};

use super::launch::{Kernel, LaunchConfig, run_grid};
use super::Device;
use crate::error::{IpcError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// In-order queue of device work.
///
/// Work is enqueued without blocking the caller and executes on a dedicated
/// worker in submission order. Use [`Stream::synchronize`] to wait for
/// everything enqueued so far.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    device: u32,
    tx: mpsc::UnboundedSender<Job>,
    submitted: AtomicU64,
    completed: watch::Receiver<u64>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("device", &self.inner.device)
            .field("submitted", &self.inner.submitted.load(Ordering::Relaxed))
            .finish()
    }
}

impl Stream {
    pub fn new(device: &Device) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (done_tx, done_rx) = watch::channel(0u64);

        std::thread::Builder::new()
            .name(format!("stream-dev{}", device.ordinal()))
            .spawn(move || {
                let mut done = 0u64;
                while let Some(job) = rx.blocking_recv() {
                    job();
                    done += 1;
                    let _ = done_tx.send(done);
                }
            })
            .map_err(|e| IpcError::device_with_source("failed to start stream worker", e))?;

        Ok(Self {
            inner: Arc::new(StreamInner {
                device: device.ordinal(),
                tx,
                submitted: AtomicU64::new(0),
                completed: done_rx,
            }),
        })
    }

    /// Ordinal of the device this stream executes on.
    pub fn device(&self) -> u32 {
        self.inner.device
    }

    pub(crate) fn enqueue(&self, job: Job) -> Result<()> {
        self.inner
            .tx
            .send(job)
            .map_err(|_| IpcError::device("stream worker has exited"))?;
        self.inner.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Enqueue a kernel launch.
    pub(crate) fn launch(
        &self,
        kernel: Arc<dyn Kernel>,
        cfg: LaunchConfig,
        warp_size: usize,
    ) -> Result<()> {
        tracing::trace!(
            kernel = kernel.name(),
            blocks = cfg.blocks,
            threads = cfg.threads,
            "launch"
        );
        self.enqueue(Box::new(move || run_grid(kernel.as_ref(), cfg, warp_size)))
    }

    /// Wait until all work enqueued before this call has finished.
    pub async fn synchronize(&self) -> Result<()> {
        let target = self.inner.submitted.load(Ordering::Acquire);
        let mut rx = self.inner.completed.clone();
        rx.wait_for(|done| *done >= target)
            .await
            .map_err(|_| IpcError::device("stream worker has exited"))?;
        Ok(())
    }
}
