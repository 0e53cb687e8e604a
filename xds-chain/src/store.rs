//! Block bodies and proven headers in the KV, keyed by hash.

use xds_codec::{Decode, Encode};
use xds_crypto::Hash;
use xds_primitives::{Block, BlockHeader, ProvenHeader};
use xds_storage::{KvStore, SharedKv, WriteBatch};

use crate::error::ChainError;

const BLOCKS_TABLE: &str = "blocks";
const PROVEN_TABLE: &str = "proven_headers";
const HEADERS_TABLE: &str = "headers";

/// Tables the block store expects.
pub const BLOCK_STORE_TABLES: &[&str] = &[BLOCKS_TABLE, PROVEN_TABLE];

/// Tables the header tree store expects.
pub const HEADER_TREE_TABLES: &[&str] = &[HEADERS_TABLE];

/// Content-addressed storage for block bodies, serialized in the
/// canonical wire form.
pub struct BlockStore {
    kv: SharedKv,
}

impl BlockStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    pub fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.put(
            BLOCKS_TABLE,
            Box::<[u8]>::from(*block.hash()),
            block.to_bytes().into_boxed_slice(),
        );
        self.kv.commit(batch)?;
        Ok(())
    }

    pub fn get_block(&self, hash: &Hash<32>) -> Result<Option<Block>, ChainError> {
        let raw = self.kv.get(BLOCKS_TABLE, hash.as_ref())?;

        match raw {
            Some(raw) => Ok(Some(Block::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash<32>) -> Result<bool, ChainError> {
        Ok(self.kv.get(BLOCKS_TABLE, hash.as_ref())?.is_some())
    }

    pub fn put_proven_header(&self, proven: &ProvenHeader) -> Result<(), ChainError> {
        let mut batch = WriteBatch::new();
        batch.put(
            PROVEN_TABLE,
            Box::<[u8]>::from(*proven.hash()),
            proven.to_bytes().into_boxed_slice(),
        );
        self.kv.commit(batch)?;
        Ok(())
    }

    pub fn get_proven_header(&self, hash: &Hash<32>) -> Result<Option<ProvenHeader>, ChainError> {
        let raw = self.kv.get(PROVEN_TABLE, hash.as_ref())?;

        match raw {
            Some(raw) => Ok(Some(ProvenHeader::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }
}

/// Headers of the active chain persisted in height order, so the
/// tree can be rebuilt without a fresh header sync.
pub struct HeaderTreeStore {
    kv: SharedKv,
}

impl HeaderTreeStore {
    pub fn new(kv: SharedKv) -> Self {
        Self { kv }
    }

    pub fn put_header(&self, height: u64, header: &BlockHeader) -> Result<(), ChainError> {
        let mut key = Vec::with_capacity(40);
        key.extend_from_slice(&height.to_be_bytes());
        key.extend_from_slice(header.hash().as_ref());

        let mut batch = WriteBatch::new();
        batch.put(
            HEADERS_TABLE,
            key.into_boxed_slice(),
            header.to_bytes().into_boxed_slice(),
        );
        self.kv.commit(batch)?;
        Ok(())
    }

    /// Every stored header, ascending by height.
    pub fn load_all(&self) -> Result<Vec<(u64, BlockHeader)>, ChainError> {
        let mut headers = Vec::new();

        for (key, value) in self.kv.iter_from(HEADERS_TABLE, None)? {
            if key.len() != 40 {
                continue;
            }

            let height = u64::from_be_bytes(key[..8].try_into().expect("length checked"));
            headers.push((height, BlockHeader::from_bytes(&value)?));
        }

        Ok(headers)
    }
}
