//! Out-of-band control plane used while a group is being set up.
//!
//! The bootstrap carries small descriptors (hostnames, IPC handles) between
//! ranks. It is never on the data path of a collective.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use futures::future::BoxFuture;
use rand::RngCore;
use tokio::sync::{Mutex, mpsc};

use crate::error::{IpcError, Result};
use crate::types::Rank;

/// Tag space reserved for the bootstrap's own collectives.
const TAG_ALL_GATHER: u64 = 1 << 63;

/// Length of a [`UniqueId`] in bytes.
pub const UNIQUE_ID_BYTES: usize = 128;

/// Opaque token identifying one group rendezvous.
///
/// Generated once (usually on rank 0) and handed to every rank out of band.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueId([u8; UNIQUE_ID_BYTES]);

impl UniqueId {
    /// Fresh random id.
    pub fn new() -> Self {
        let mut bytes = [0u8; UNIQUE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; UNIQUE_ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; UNIQUE_ID_BYTES] {
        &self.0
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "UniqueId(")?;
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// Point-to-point and collective control messaging between ranks.
///
/// Messages between one sender and one receiver with the same tag arrive in
/// send order. Sends never block on the receiver.
pub trait Bootstrap: Send + Sync {
    fn rank(&self) -> Rank;

    fn world_size(&self) -> u32;

    fn send<'a>(&'a self, peer: Rank, tag: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    fn recv<'a>(&'a self, peer: Rank, tag: u64) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// Gather one payload from every rank, indexed by rank.
    fn all_gather<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, Result<Vec<Vec<u8>>>> {
        Box::pin(ring_all_gather(self, data))
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.all_gather(&[]).await?;
            Ok(())
        })
    }
}

/// Ring all-gather: in step `s` each rank forwards the payload it received
/// in step `s - 1` to its right neighbour.
async fn ring_all_gather<B: Bootstrap + ?Sized>(b: &B, data: &[u8]) -> Result<Vec<Vec<u8>>> {
    let world = b.world_size();
    let rank = b.rank();
    let mut out = vec![Vec::new(); world as usize];
    out[rank as usize] = data.to_vec();
    if world == 1 {
        return Ok(out);
    }
    let right = (rank + 1) % world;
    let left = (rank + world - 1) % world;
    for step in 0..world - 1 {
        let send_idx = (rank + world - step) % world;
        let recv_idx = (rank + world - step - 1) % world;
        b.send(right, TAG_ALL_GATHER, &out[send_idx as usize]).await?;
        out[recv_idx as usize] = b.recv(left, TAG_ALL_GATHER).await?;
    }
    Ok(out)
}

struct Envelope {
    src: Rank,
    tag: u64,
    payload: Vec<u8>,
}

/// Shared mailbox set for one in-process group.
struct Hub {
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    receivers: StdMutex<Vec<Option<mpsc::UnboundedReceiver<Envelope>>>>,
}

impl Hub {
    fn new(world_size: u32) -> Self {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..world_size)
            .map(|_| {
                let (tx, rx) = mpsc::unbounded_channel();
                (tx, Some(rx))
            })
            .unzip();
        Self {
            senders,
            receivers: StdMutex::new(receivers),
        }
    }
}

fn rendezvous() -> &'static StdMutex<HashMap<UniqueId, Arc<Hub>>> {
    static REGISTRY: OnceLock<StdMutex<HashMap<UniqueId, Arc<Hub>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| StdMutex::new(HashMap::new()))
}

struct Inbox {
    rx: mpsc::UnboundedReceiver<Envelope>,
    /// Messages that arrived before anyone asked for their `(src, tag)`.
    pending: HashMap<(Rank, u64), VecDeque<Vec<u8>>>,
}

/// Bootstrap for ranks living in one process, connected through in-memory
/// mailboxes.
pub struct LocalBootstrap {
    rank: Rank,
    world_size: u32,
    hub: Arc<Hub>,
    inbox: Mutex<Inbox>,
    timeout: Duration,
}

impl LocalBootstrap {
    /// Join the rendezvous named by `id` as `rank`.
    ///
    /// Every rank of the group must join with the same `id` and
    /// `world_size`. Joining does not wait for the other ranks.
    pub fn join(id: &UniqueId, rank: Rank, world_size: u32, timeout: Duration) -> Result<Self> {
        if world_size == 0 {
            return Err(IpcError::invalid("world size must be at least 1"));
        }
        if rank >= world_size {
            return Err(IpcError::InvalidRank { rank, world_size });
        }

        let mut registry = rendezvous()
            .lock()
            .map_err(|_| IpcError::device("rendezvous registry poisoned"))?;
        let hub = Arc::clone(
            registry
                .entry(*id)
                .or_insert_with(|| Arc::new(Hub::new(world_size))),
        );
        if hub.senders.len() != world_size as usize {
            return Err(IpcError::invalid(format!(
                "rendezvous {id:?} was created for {} ranks, joined with {world_size}",
                hub.senders.len()
            )));
        }

        let (rx, all_joined) = {
            let mut receivers = hub
                .receivers
                .lock()
                .map_err(|_| IpcError::device("rendezvous hub poisoned"))?;
            let rx = receivers[rank as usize]
                .take()
                .ok_or_else(|| IpcError::invalid(format!("rank {rank} already joined {id:?}")))?;
            (rx, receivers.iter().all(Option::is_none))
        };
        if all_joined {
            registry.remove(id);
        }

        tracing::debug!(rank, world_size, "joined local bootstrap");

        Ok(Self {
            rank,
            world_size,
            hub,
            inbox: Mutex::new(Inbox {
                rx,
                pending: HashMap::new(),
            }),
            timeout,
        })
    }

    /// Create a complete group of `world_size` connected bootstraps.
    pub fn local_group(world_size: u32, timeout: Duration) -> Result<Vec<Self>> {
        let id = UniqueId::new();
        (0..world_size)
            .map(|rank| Self::join(&id, rank, world_size, timeout))
            .collect()
    }

    fn check_peer(&self, peer: Rank) -> Result<()> {
        if peer >= self.world_size {
            return Err(IpcError::InvalidRank {
                rank: peer,
                world_size: self.world_size,
            });
        }
        Ok(())
    }
}

impl Bootstrap for LocalBootstrap {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send<'a>(&'a self, peer: Rank, tag: u64, data: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check_peer(peer)?;
            self.hub.senders[peer as usize]
                .send(Envelope {
                    src: self.rank,
                    tag,
                    payload: data.to_vec(),
                })
                .map_err(|_| IpcError::PeerDisconnected { rank: peer })
        })
    }

    fn recv<'a>(&'a self, peer: Rank, tag: u64) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.check_peer(peer)?;
            let mut inbox = self.inbox.lock().await;
            if let Some(payload) = inbox
                .pending
                .get_mut(&(peer, tag))
                .and_then(VecDeque::pop_front)
            {
                return Ok(payload);
            }

            let deadline = tokio::time::Instant::now() + self.timeout;
            loop {
                let env = match tokio::time::timeout_at(deadline, inbox.rx.recv()).await {
                    Ok(Some(env)) => env,
                    Ok(None) => return Err(IpcError::PeerDisconnected { rank: peer }),
                    Err(_) => {
                        return Err(IpcError::PeerTimeout {
                            operation: "bootstrap recv",
                            rank: peer,
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                };
                if env.src == peer && env.tag == tag {
                    return Ok(env.payload);
                }
                inbox
                    .pending
                    .entry((env.src, env.tag))
                    .or_default()
                    .push_back(env.payload);
            }
        })
    }
}
