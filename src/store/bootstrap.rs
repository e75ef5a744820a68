//! Store and first-cell bootstrap.
//!
//! A fresh store writes its identity once, then seeds one cell covering
//! the whole keyspace. Everything after that happens through consensus.

use tracing::info;

use crate::cell::storage::write_initial_cell_state;
use crate::core::error::{Error, Result};
use crate::engine::KvEngine;
use crate::meta::keys::store_ident_key;
use crate::meta::{decode, encode, Cell, StoreIdent};

/// Read the store identity, if the store has been bootstrapped.
pub fn load_store_ident(meta_engine: &dyn KvEngine) -> Result<Option<StoreIdent>> {
    meta_engine
        .get(&store_ident_key())?
        .map(|v| decode(&v))
        .transpose()
}

/// Write the store identity. Refuses to run twice.
pub fn bootstrap_store(meta_engine: &dyn KvEngine, cluster_id: u64, store_id: u64) -> Result<()> {
    if load_store_ident(meta_engine)?.is_some() {
        return Err(Error::corrupt("store is already bootstrapped"));
    }
    let ident = StoreIdent {
        cluster_id,
        store_id,
    };
    meta_engine.set(&store_ident_key(), &encode(&ident)?)?;
    info!(target: "raftstore", cluster = cluster_id, store = store_id, "store bootstrapped");
    Ok(())
}

/// Seed the first cell's durable state. The cell must carry at least one
/// peer; an empty peer set would leave it uninitialized forever.
pub fn bootstrap_first_cell(meta_engine: &dyn KvEngine, cell: &Cell) -> Result<()> {
    if cell.peers.is_empty() {
        return Err(Error::corrupt("first cell needs a non-empty peer set"));
    }
    write_initial_cell_state(meta_engine, cell)?;
    info!(target: "raftstore", cell = cell.id, "first cell bootstrapped");
    Ok(())
}
