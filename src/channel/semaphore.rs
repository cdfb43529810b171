use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::device::{ipc, spin_until};
use crate::error::{IpcError, Result};
use crate::transport::{Bootstrap, Connection};
use crate::types::Rank;

const TAG_SEMAPHORE: u64 = 0x5345_4d41;

/// Counter pair shared with one peer.
///
/// `signal` bumps the peer's inbound counter; `wait` blocks until our own
/// inbound counter reaches the number of waits issued so far. One semaphore
/// exists per connection and is shared by every channel to that peer.
pub(crate) struct Semaphore {
    peer: Rank,
    inbound: Arc<AtomicU64>,
    outbound: Arc<AtomicU64>,
    expected: AtomicU64,
    spin_before_yield: u32,
}

impl Semaphore {
    pub(crate) fn peer(&self) -> Rank {
        self.peer
    }

    /// Signal without ordering prior memory operations beyond this counter.
    #[inline]
    pub(crate) fn relaxed_signal(&self) {
        self.outbound.fetch_add(1, Ordering::Release);
    }

    /// Signal after making every prior write visible to the peer.
    #[inline]
    pub(crate) fn signal(&self) {
        fence(Ordering::SeqCst);
        self.outbound.fetch_add(1, Ordering::Release);
    }

    #[inline]
    pub(crate) fn wait(&self) {
        let target = self.expected.fetch_add(1, Ordering::Relaxed) + 1;
        spin_until(
            || self.inbound.load(Ordering::Acquire) >= target,
            self.spin_before_yield,
        );
    }
}

/// Build one semaphore per connection by swapping counter handles.
///
/// Collective among the connected ranks. Connections must be in ascending
/// peer order on every rank.
pub(crate) async fn setup_semaphores(
    bootstrap: &dyn Bootstrap,
    host: &str,
    connections: &[Connection],
    spin_before_yield: u32,
) -> Result<Vec<Arc<Semaphore>>> {
    let mut inbound = Vec::with_capacity(connections.len());
    for conn in connections {
        let counter = Arc::new(AtomicU64::new(0));
        let handle = ipc::export_counter(&counter, host)?;
        bootstrap
            .send(conn.remote_rank(), TAG_SEMAPHORE, &handle.as_u64().to_le_bytes())
            .await?;
        inbound.push(counter);
    }

    let mut out = Vec::with_capacity(connections.len());
    for (conn, inbound) in connections.iter().zip(inbound) {
        let peer = conn.remote_rank();
        let bytes = bootstrap.recv(peer, TAG_SEMAPHORE).await?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| IpcError::DecodeFailed(format!("semaphore handle from rank {peer} has {} bytes", bytes.len())))?;
        let outbound = ipc::open_counter(crate::device::IpcHandle::from_u64(u64::from_le_bytes(raw)), host)?;
        out.push(Arc::new(Semaphore {
            peer,
            inbound,
            outbound,
            expected: AtomicU64::new(0),
            spin_before_yield,
        }));
    }
    Ok(out)
}

#[cfg(test)]
pub(crate) fn semaphore_pair(spin_before_yield: u32) -> (Semaphore, Semaphore) {
    let a_in = Arc::new(AtomicU64::new(0));
    let b_in = Arc::new(AtomicU64::new(0));
    let a = Semaphore {
        peer: 1,
        inbound: Arc::clone(&a_in),
        outbound: Arc::clone(&b_in),
        expected: AtomicU64::new(0),
        spin_before_yield,
    };
    let b = Semaphore {
        peer: 0,
        inbound: b_in,
        outbound: a_in,
        expected: AtomicU64::new(0),
        spin_before_yield,
    };
    (a, b)
}
