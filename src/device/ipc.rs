//! Inter-process handle table.
//!
//! Exporting memory or a semaphore counter yields an opaque [`IpcHandle`]
//! that another rank on the same host can open to obtain its own mapping.
//! The table only holds weak references: a handle stops resolving once the
//! exporter and every opener have dropped the object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};

use super::memory::{DeviceBuffer, WeakBuffer};
use crate::error::{IpcError, Result};

/// Opaque, host-scoped handle to exported device memory or a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcHandle(pub(crate) u64);

impl IpcHandle {
    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

enum Exported {
    Memory(WeakBuffer),
    Counter(Weak<AtomicU64>),
}

impl Exported {
    fn is_live(&self) -> bool {
        match self {
            Exported::Memory(w) => w.is_live(),
            Exported::Counter(w) => w.strong_count() > 0,
        }
    }
}

struct Entry {
    host: String,
    object: Exported,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn table() -> &'static RwLock<HashMap<u64, Entry>> {
    static TABLE: OnceLock<RwLock<HashMap<u64, Entry>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn export(host: &str, object: Exported) -> Result<IpcHandle> {
    let raw = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let mut table = table()
        .write()
        .map_err(|_| IpcError::device("ipc handle table poisoned"))?;
    table.retain(|_, e| e.object.is_live());
    table.insert(
        raw,
        Entry {
            host: host.to_owned(),
            object,
        },
    );
    Ok(IpcHandle(raw))
}

fn with_entry<T>(
    handle: IpcHandle,
    host: &str,
    f: impl FnOnce(&Exported) -> Option<T>,
) -> Result<T> {
    let table = table()
        .read()
        .map_err(|_| IpcError::device("ipc handle table poisoned"))?;
    let entry = table
        .get(&handle.0)
        .ok_or_else(|| IpcError::device(format!("unknown ipc handle {:#x}", handle.0)))?;
    if entry.host != host {
        return Err(IpcError::device(format!(
            "ipc handle {:#x} was exported on host {}, cannot open it on {host}",
            handle.0, entry.host
        )));
    }
    f(&entry.object)
        .ok_or_else(|| IpcError::device(format!("ipc handle {:#x} is stale or of the wrong kind", handle.0)))
}

/// Export device memory so same-host peers can map it.
pub(crate) fn export_memory(buf: &DeviceBuffer, host: &str) -> Result<IpcHandle> {
    export(host, Exported::Memory(buf.downgrade()))
}

/// Map memory exported by a peer on `host`.
pub(crate) fn open_memory(handle: IpcHandle, host: &str) -> Result<DeviceBuffer> {
    with_entry(handle, host, |obj| match obj {
        Exported::Memory(w) => w.upgrade(),
        Exported::Counter(_) => None,
    })
}

/// Export a semaphore counter so the peer can signal into it.
pub(crate) fn export_counter(counter: &Arc<AtomicU64>, host: &str) -> Result<IpcHandle> {
    export(host, Exported::Counter(Arc::downgrade(counter)))
}

pub(crate) fn open_counter(handle: IpcHandle, host: &str) -> Result<Arc<AtomicU64>> {
    with_entry(handle, host, |obj| match obj {
        Exported::Counter(w) => w.upgrade(),
        Exported::Memory(_) => None,
    })
}
