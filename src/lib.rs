//! Intra-host collective communication between accelerator ranks.
//!
//! Ranks on the same host map each other's device memory and synchronize
//! through device semaphores. All-reduce picks between a low-latency packet
//! protocol for small messages and a bandwidth-oriented direct-read
//! protocol for large ones; all-gather pulls every peer's contribution
//! directly.
//!
//! ```no_run
//! # async fn demo() -> nexar_ipc::Result<()> {
//! use nexar_ipc::{Communicator, DataType, IpcConfig, ReduceOp};
//!
//! let comms = Communicator::bootstrap_local(2, IpcConfig::default()).await?;
//! let comm = &comms[0];
//! let stream = comm.create_stream()?;
//! let buf = comm.device().alloc_from(&[1.0f32, 2.0, 3.0])?;
//! comm.all_reduce(&buf, &buf, 3, DataType::F32, ReduceOp::Sum, &stream).await?;
//! stream.synchronize().await?;
//! # Ok(())
//! # }
//! ```

mod channel;
mod collective;
mod comm;
pub mod config;
pub mod device;
pub mod error;
mod reduce;
pub mod topology;
pub mod transport;
pub mod types;

pub use channel::{ChannelKey, ChannelPath, ChannelPurpose, SmChannel};
pub use collective::AllReducePath;
pub use comm::Communicator;
pub use config::IpcConfig;
pub use device::{BufferId, Device, DeviceBuffer, IpcHandle, LaunchConfig, Platform, Stream};
pub use error::{IpcError, Result, ResultCode, error_string};
pub use topology::NodeTopology;
pub use transport::{Bootstrap, LocalBootstrap, UniqueId};
pub use types::{DataType, Element, Rank, ReduceOp};

/// Fresh rendezvous id for [`Communicator::init_rank`].
pub fn get_unique_id() -> UniqueId {
    UniqueId::new()
}
