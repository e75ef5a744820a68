//! Storage engine abstraction.
//!
//! Two logical keyspaces back a store: the meta engine (raft log and
//! per-cell durable state) and the data engine (user keys). Both sit
//! behind [`KvEngine`]; the engines themselves are external collaborators
//! and only their contract is fixed here. Writes are atomic at single-key
//! granularity, which is all the ready-processing persistence order
//! relies on.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::error::Result;

/// Scan callback. Returning `Ok(false)` stops the scan early.
pub type ScanFn<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> Result<bool>;

/// Contract both engines must satisfy.
///
/// `scan` visits keys in `[start, end)` in ascending order; an empty `end`
/// means "to the end of the keyspace".
pub trait KvEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn delete(&self, key: &[u8]) -> Result<()>;
    fn scan(&self, start: &[u8], end: &[u8], f: ScanFn<'_>) -> Result<()>;
}

/// Delete every key in `[start, end)`.
pub fn delete_range(engine: &dyn KvEngine, start: &[u8], end: &[u8]) -> Result<()> {
    let mut keys = Vec::new();
    engine.scan(start, end, &mut |key, _| {
        keys.push(key.to_vec());
        Ok(true)
    })?;
    for key in keys {
        engine.delete(&key)?;
    }
    Ok(())
}

/// In-memory engine used by tests and bootstrap tooling.
#[derive(Default)]
pub struct MemEngine {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.map.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn scan(&self, start: &[u8], end: &[u8], f: ScanFn<'_>) -> Result<()> {
        // Snapshot the range up front so the callback may call back into
        // the engine without deadlocking on the map lock.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> = {
            let map = self.map.read();
            let upper = if end.is_empty() {
                Bound::Unbounded
            } else {
                Bound::Excluded(end.to_vec())
            };
            map.range((Bound::Included(start.to_vec()), upper))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in pairs {
            if !f(&key, &value)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_honors_bounds_and_early_stop() {
        let engine = MemEngine::new();
        for key in [b"a", b"b", b"c", b"d"] {
            engine.set(key, b"v").unwrap();
        }

        let mut seen = Vec::new();
        engine
            .scan(b"b", b"d", &mut |key, _| {
                seen.push(key.to_vec());
                Ok(true)
            })
            .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"c".to_vec()]);

        let mut seen = Vec::new();
        engine
            .scan(b"a", b"", &mut |key, _| {
                seen.push(key.to_vec());
                Ok(seen.len() < 2)
            })
            .unwrap();
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn delete_range_removes_half_open_interval() {
        let engine = MemEngine::new();
        for key in [b"a", b"b", b"c"] {
            engine.set(key, b"v").unwrap();
        }
        delete_range(engine.as_ref(), b"a", b"c").unwrap();
        assert!(engine.get(b"a").unwrap().is_none());
        assert!(engine.get(b"b").unwrap().is_none());
        assert!(engine.get(b"c").unwrap().is_some());
    }
}
