//! Per-cell runtime: durable storage, pending reads, the apply delegate
//! and the driver that ties them to the consensus node.

pub mod apply;
pub mod read_queue;
pub mod replicate;
pub mod storage;
