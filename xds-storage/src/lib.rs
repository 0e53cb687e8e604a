//! Ordered transactional key-value storage.
//!
//! The chain core consumes storage through the [`KvStore`] contract:
//! named tables, ordered iteration, and atomic multi-key commits via
//! [`WriteBatch`]. Two backends implement it: [`MemoryKv`] (BTreeMap,
//! for tests and throwaway nodes) and [`RocksKv`] (column family per
//! table).

use std::sync::Arc;

pub mod memory;
pub mod rocks;
pub mod table;

pub use memory::MemoryKv;
pub use rocks::RocksKv;
pub use table::{DbHash, DbInt, DbSerde, KvTable};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage I/O failure")]
    Io(String),

    #[error("value failed to (de)serialize")]
    Serde,

    #[error("unknown table {0}")]
    UnknownTable(&'static str),
}

/// One staged mutation.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        table: &'static str,
        key: Box<[u8]>,
        value: Box<[u8]>,
    },
    Delete {
        table: &'static str,
        key: Box<[u8]>,
    },
}

/// Mutations staged for one atomic commit.
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: &'static str, key: impl Into<Box<[u8]>>, value: impl Into<Box<[u8]>>) {
        self.ops.push(BatchOp::Put {
            table,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, table: &'static str, key: impl Into<Box<[u8]>>) {
        self.ops.push(BatchOp::Delete {
            table,
            key: key.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Ordered transactional KV contract consumed by the node core.
///
/// Keys within a table are ordered bytewise; `commit` applies a whole
/// batch atomically or not at all.
pub trait KvStore: Send + Sync + 'static {
    fn get(&self, table: &'static str, key: &[u8]) -> Result<Option<Box<[u8]>>, Error>;

    fn commit(&self, batch: WriteBatch) -> Result<(), Error>;

    /// Entries in ascending key order starting at `from` (inclusive),
    /// or from the first key when `from` is `None`.
    fn iter_from(
        &self,
        table: &'static str,
        from: Option<&[u8]>,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, Error>;

    /// Last entry in key order, if any.
    fn last(&self, table: &'static str) -> Result<Option<(Box<[u8]>, Box<[u8]>)>, Error>;
}

/// Shared handle used across the node.
pub type SharedKv = Arc<dyn KvStore>;
