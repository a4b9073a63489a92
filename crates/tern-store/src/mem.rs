use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use crate::{StoreResult, Vatstore};

/// In-memory vatstore for tests and single-process runs.
#[derive(Clone, Default)]
pub struct MemVatstore {
    entries: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemVatstore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every key, in order.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().unwrap().keys().cloned().collect()
    }
}

impl fmt::Debug for MemVatstore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap();
        f.debug_struct("MemVatstore").field("entries", &entries.len()).finish()
    }
}

impl Vatstore for MemVatstore {
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.entries.write().unwrap().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn get_after(&self, prior: &str, prefix: &str) -> StoreResult<Option<(String, Vec<u8>)>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .range::<str, _>((Bound::Excluded(prior), Bound::Unbounded))
            .find(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone())))
    }
}
