use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::sm_channel::{DeviceChannel, SmChannel};
use super::Fabric;
use crate::device::{BufferId, DeviceBuffer};
use crate::error::{IpcError, Result};
use crate::transport::{RegisteredMemory, TransportFlags, exchange_registrations};

/// Which collective algorithm a channel set serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPath {
    /// Small all-reduce; channels target the peers' scratch buffers.
    Packet,
    /// Large all-reduce; channels target the peers' send (and recv) buffers.
    Bulk,
    /// All-gather; channels target the peers' recv buffers.
    Gather,
}

/// Identity of one cached channel set.
///
/// Buffer ids are never reused, so a key cannot alias a freed allocation.
/// The path is part of the key because each path wires its channels to a
/// different peer memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub path: ChannelPath,
    pub send: BufferId,
    pub recv: BufferId,
    pub bytes: usize,
}

/// Role of a channel set within an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPurpose {
    /// Channels whose local side is the send buffer.
    Send,
    /// Channels whose local side is a distinct recv buffer.
    Output,
}

/// Immutable snapshot of device channel handles read by kernels.
pub(crate) struct ChannelTable {
    pub send: Vec<DeviceChannel>,
    pub output: Vec<DeviceChannel>,
}

impl ChannelTable {
    /// Channels to read peers' results from: the output set when present.
    pub(crate) fn result_channels(&self) -> &[DeviceChannel] {
        if self.output.is_empty() {
            &self.send
        } else {
            &self.output
        }
    }
}

struct ChannelEntry {
    // Held so the registered buffers outlive the channels built on them.
    _send_buffer: DeviceBuffer,
    output_buffer: Option<DeviceBuffer>,
    send: Vec<SmChannel>,
    output: Vec<SmChannel>,
    table: Arc<ChannelTable>,
}

impl ChannelEntry {
    fn rebuild_table(&mut self) {
        self.table = Arc::new(ChannelTable {
            send: self.send.iter().map(SmChannel::device_handle).collect(),
            output: self.output.iter().map(SmChannel::device_handle).collect(),
        });
    }
}

/// Cache of channel sets keyed by [`ChannelKey`].
///
/// Entries live as long as the registry. Creating an entry is collective:
/// every rank must miss on the same call.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    entries: HashMap<ChannelKey, ChannelEntry>,
}

impl ChannelRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return the channel table for `key`, building the `purpose` set around
    /// `local` on first use.
    pub(crate) async fn acquire(
        &mut self,
        fabric: &Fabric,
        key: ChannelKey,
        local: &DeviceBuffer,
        purpose: ChannelPurpose,
    ) -> Result<Arc<ChannelTable>> {
        match purpose {
            ChannelPurpose::Send => {
                if let Some(entry) = self.entries.get(&key) {
                    tracing::trace!(?key, "channel cache hit");
                    return Ok(Arc::clone(&entry.table));
                }
                let send = build_channels(fabric, key.path, local).await?;
                tracing::debug!(
                    rank = fabric.rank,
                    ?key,
                    channels = send.len(),
                    "registered send channels"
                );
                let mut entry = ChannelEntry {
                    _send_buffer: local.clone(),
                    output_buffer: None,
                    send,
                    output: Vec::new(),
                    table: Arc::new(ChannelTable {
                        send: Vec::new(),
                        output: Vec::new(),
                    }),
                };
                entry.rebuild_table();
                let table = Arc::clone(&entry.table);
                self.entries.insert(key, entry);
                Ok(table)
            }
            ChannelPurpose::Output => {
                let entry = self.entries.get_mut(&key).ok_or_else(|| {
                    IpcError::invalid("output channels requested before send channels")
                })?;
                if key.send == key.recv || entry.output_buffer.is_some() {
                    return Ok(Arc::clone(&entry.table));
                }
                let output = build_channels(fabric, key.path, local).await?;
                tracing::debug!(
                    rank = fabric.rank,
                    ?key,
                    channels = output.len(),
                    "registered output channels"
                );
                entry.output = output;
                entry.output_buffer = Some(local.clone());
                entry.rebuild_table();
                Ok(Arc::clone(&entry.table))
            }
        }
    }
}

/// One channel per same-host peer, in ascending peer order.
async fn build_channels(
    fabric: &Fabric,
    path: ChannelPath,
    local: &DeviceBuffer,
) -> Result<Vec<SmChannel>> {
    match path {
        ChannelPath::Packet => Ok(fabric
            .links
            .iter()
            .map(|link| {
                SmChannel::with_mapping(
                    Arc::clone(&link.semaphore),
                    link.remote_scratch.clone(),
                    link.scratch_view.clone(),
                    local.clone(),
                )
            })
            .collect()),
        ChannelPath::Bulk | ChannelPath::Gather => {
            let reg = RegisteredMemory::register(local, fabric.rank, &fabric.host, TransportFlags::CUDA_IPC)?;
            let peers: Vec<_> = fabric.links.iter().map(|l| l.connection.remote_rank()).collect();
            let remote = exchange_registrations(fabric.bootstrap.as_ref(), &reg, &peers).await?;
            fabric
                .links
                .iter()
                .zip(remote)
                .map(|(link, mem)| {
                    SmChannel::connect(&link.connection, Arc::clone(&link.semaphore), mem, local.clone())
                })
                .collect()
        }
    }
}

/// Published copy of the channel table that kernels read.
///
/// Kernels launch with the table returned by [`ConstantBank::publish`],
/// which is the one the bank holds. Device memory is host-backed, so the
/// published copy shares the registry's allocation instead of being copied
/// into a separate constant segment. Re-publishing the table that is
/// already current is skipped.
#[derive(Default)]
pub(crate) struct ConstantBank {
    current: Mutex<Option<(ChannelKey, Arc<ChannelTable>)>>,
}

impl ConstantBank {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `table` the current device table and return the bank's copy.
    pub(crate) fn publish(&self, key: ChannelKey, table: &Arc<ChannelTable>) -> Result<Arc<ChannelTable>> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| IpcError::device("constant bank poisoned"))?;
        match current.as_ref() {
            Some((k, t)) if *k == key && Arc::ptr_eq(t, table) => {
                tracing::trace!(?key, "device channel table unchanged");
                Ok(Arc::clone(t))
            }
            _ => {
                tracing::trace!(?key, "refreshing device channel table");
                let (_, published) = current.insert((key, Arc::clone(table)));
                Ok(Arc::clone(published))
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn current_key(&self) -> Option<ChannelKey> {
        self.current.lock().ok()?.as_ref().map(|(k, _)| *k)
    }
}
