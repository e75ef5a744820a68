//! Ordered index of the initialized cells this store hosts.
//!
//! Maps each cell's start key to its id and end key; consulted to route
//! client commands and rebalanced on split and snapshot apply. Ranges
//! never overlap; an overlapping insert is a bug in the caller.

use std::collections::BTreeMap;

use crate::core::error::{Error, Result};
use crate::meta::Cell;

#[derive(Debug, Clone)]
struct RangeEntry {
    cell_id: u64,
    end_key: Vec<u8>,
}

/// Interval map from start key to owning cell.
#[derive(Debug, Default)]
pub struct KeyRangeIndex {
    ranges: BTreeMap<Vec<u8>, RangeEntry>,
}

impl KeyRangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cell's range. Overlap with an existing range is an
    /// invariant violation surfaced as corruption.
    pub fn insert(&mut self, cell: &Cell) -> Result<()> {
        // The nearest range at or before the new start must end first.
        if let Some((start, entry)) = self.ranges.range(..=cell.start_key.clone()).next_back() {
            let open_ended = entry.end_key.is_empty();
            if *start == cell.start_key || open_ended || entry.end_key > cell.start_key {
                return Err(Error::corrupt(format!(
                    "range of cell {} overlaps cell {}",
                    cell.id, entry.cell_id
                )));
            }
        }
        // And the nearest range after it must start past the new end.
        if let Some((start, entry)) = self
            .ranges
            .range(cell.start_key.clone()..)
            .next()
        {
            if cell.end_key.is_empty() || *start < cell.end_key {
                return Err(Error::corrupt(format!(
                    "range of cell {} overlaps cell {}",
                    cell.id, entry.cell_id
                )));
            }
        }

        self.ranges.insert(
            cell.start_key.clone(),
            RangeEntry {
                cell_id: cell.id,
                end_key: cell.end_key.clone(),
            },
        );
        Ok(())
    }

    /// Drop the range registered at this cell's start key, if it is owned
    /// by this cell. Returns whether anything was removed.
    pub fn remove(&mut self, cell: &Cell) -> bool {
        match self.ranges.get(&cell.start_key) {
            Some(entry) if entry.cell_id == cell.id => {
                self.ranges.remove(&cell.start_key);
                true
            }
            _ => false,
        }
    }

    /// The cell owning `key`, if any.
    pub fn find(&self, key: &[u8]) -> Option<u64> {
        let (_, entry) = self.ranges.range(..=key.to_vec()).next_back()?;
        if entry.end_key.is_empty() || key < entry.end_key.as_slice() {
            Some(entry.cell_id)
        } else {
            None
        }
    }

    /// Whether any registered range belongs to `cell_id`.
    pub fn contains_cell(&self, cell_id: u64) -> bool {
        self.ranges.values().any(|e| e.cell_id == cell_id)
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
