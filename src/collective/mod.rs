//! Collective algorithms and the dispatch layer that selects between them.

mod allgather;
mod allreduce;
mod bulk;
mod copy;
mod dispatch;
mod layout;
mod packet;

pub use dispatch::AllReducePath;
pub(crate) use dispatch::{all_gather, all_reduce, select_all_reduce_path};
