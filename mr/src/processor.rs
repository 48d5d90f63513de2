use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The unit of intermediate and output data.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        KeyValue {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Turns the full contents of one input file into key/value pairs.
pub trait Mapper {
    fn map(&self, data: &[u8]) -> anyhow::Result<Vec<KeyValue>>;
}

/// Collapses every value emitted under `key` into one value.
pub trait Reducer {
    fn reduce(&self, key: &str, values: &[String]) -> anyhow::Result<String>;
}

/// A processor a worker can run both phases with.
pub trait MapReducer: Mapper + Reducer + Send + Sync {}

impl<T: Mapper + Reducer + Send + Sync> MapReducer for T {}

/// Name -> processor table a worker is built with.
///
/// Jobs only carry the processor name across the wire; each worker resolves
/// it against its own registry.
#[derive(Clone, Default)]
pub struct Processors {
    table: HashMap<String, Arc<dyn MapReducer>>,
}

impl Processors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, processor: impl MapReducer + 'static) -> Self {
        self.insert(name, Arc::new(processor));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, processor: Arc<dyn MapReducer>) {
        self.table.insert(name.into(), processor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn MapReducer>> {
        self.table
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProcessor(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

impl fmt::Debug for Processors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("Processors").field("names", &names).finish()
    }
}

/// FNV-1a of the key, truncated to 32 bits and masked non-negative.
pub fn ihash(key: &str) -> u32 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(key.as_bytes());
    (hasher.finish() as u32) & 0x7fff_ffff
}

/// Reduce partition a key is routed to. `r` must be at least 1.
pub fn partition(key: &str, r: usize) -> usize {
    ihash(key) as usize % r
}
