mod bootstrap;
mod registration;

pub use bootstrap::{Bootstrap, LocalBootstrap, UNIQUE_ID_BYTES, UniqueId};
pub use registration::{Connection, RegisteredMemory, Transport, TransportFlags};

pub(crate) use registration::exchange_registrations;
