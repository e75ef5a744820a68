//! Cellstore - the per-peer raft integration core of a cell-sharded,
//! replicated key-value store.
//!
//! Data is partitioned into cells (contiguous key ranges); each cell is
//! replicated by an independent consensus group. This crate is one
//! replica's side of that machinery: the glue between the consensus
//! library (replication, ready batches, read index), durable local
//! storage, the asynchronous apply pipeline, the snapshot lifecycle, and
//! the admin operations (membership change, split) that rewrite a cell's
//! identity while it keeps serving.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Store                                │
//! │   replica map │ peer cache │ key ranges │ PD boundary │ loop    │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       PeerReplicate (per cell)                  │
//! │   proposals │ ready batches │ pending reads │ post-apply        │
//! └─────────────────────────────────────────────────────────────────┘
//!                │                                  │
//! ┌──────────────────────────────┐  ┌──────────────────────────────┐
//! │         PeerStorage          │  │        ApplyDelegate         │
//! │  raft log │ durable states   │  │  committed entries → data    │
//! └──────────────────────────────┘  └──────────────────────────────┘
//!                │                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    meta engine  /  data engine                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Store configuration and validation
//! - [`core::error`] - Error types and the consensus-library mapping
//!
//! ## Metadata
//! - [`meta`] - Cells, peers, epochs and durable local states
//! - [`meta::keys`] - Meta-engine key layout
//!
//! ## Per-cell runtime
//! - [`cell::storage`] - Consensus storage contract and persistence
//! - [`cell::read_queue`] - Pending linearizable reads
//! - [`cell::apply`] - Apply delegate and worker
//! - [`cell::replicate`] - The per-cell driver
//!
//! ## Store
//! - [`store`] - Process-wide coordinator and event loop
//! - [`store::key_range`] - Interval index of hosted cells
//! - [`store::bootstrap`] - Store and first-cell bootstrap
//!
//! ## Boundaries
//! - [`engine`] - Storage engine contract and in-memory engine
//! - [`transport`] - Outbound raft message seam
//! - [`pd`] - Placement-driver client boundary
//! - [`worker`] - Background workers (snapshot, split check, PD)
//!
//! # Key Invariants
//!
//! - Truncated index ≤ applied index ≤ committed ≤ last index
//! - Every log index between truncated and last is present in the meta
//!   engine
//! - An initialized cell always has a registered key range
//! - At most one snapshot job of each kind per cell is in flight
//! - At most one change-peer proposal is pending per cell
//! - A read state always matches the head pending read
//! - Linearizable reads are served only once the leader has applied an
//!   entry of its own term

// Core infrastructure
pub mod core;

// Cell metadata and key layout
pub mod meta;

// Storage engine boundary
pub mod engine;

// Command model
pub mod cmd;

// Per-cell runtime
pub mod cell;

// Process-wide coordinator
pub mod store;

// Background workers
pub mod worker;

// External boundaries
pub mod pd;
pub mod transport;

// Re-exports for convenience
pub use self::core::{config, error};
pub use cell::{apply, read_queue, replicate, storage};
pub use store::{bootstrap, key_range};
