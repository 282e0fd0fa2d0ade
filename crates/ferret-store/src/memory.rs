use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use imbl::OrdMap;

use crate::error::StoreError;
use crate::store::{BatchOp, Store, WriteBatch};

type Keyspace = OrdMap<Vec<u8>, Vec<u8>>;

/// In-memory store: a copy-on-write ordered map published through an
/// [`ArcSwap`]. Readers load a snapshot without blocking; writers serialise
/// on a mutex, clone the map (O(1) structural sharing), mutate, and swap.
pub struct MemoryStore {
    data: ArcSwap<Keyspace>,
    write_lock: Mutex<()>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            data: ArcSwap::new(Arc::new(OrdMap::new())),
            write_lock: Mutex::new(()),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries. Test helper.
    pub fn len(&self) -> usize {
        self.data.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.load().is_empty()
    }

    fn mutate(&self, f: impl FnOnce(&mut Keyspace)) -> Result<(), StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Storage(format!("write lock poisoned: {e}")))?;
        let mut map = (**self.data.load()).clone();
        f(&mut map);
        self.data.store(Arc::new(map));
        Ok(())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.load().get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.insert(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.mutate(|map| {
            map.remove(key);
        })
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.mutate(|map| {
            for op in batch.into_ops() {
                match op {
                    BatchOp::Put { key, value } => {
                        map.insert(key, value);
                    }
                    BatchOp::Delete { key } => {
                        map.remove(&key);
                    }
                }
            }
        })
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + Send>, StoreError> {
        let snapshot = self.data.load_full();
        let prefix = prefix.to_vec();
        let entries: Vec<(Vec<u8>, Vec<u8>)> = snapshot
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(entries.into_iter()))
    }
}
