//! In-memory index of the header tree and the best chain.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use num_bigint::BigUint;
use tracing::{debug, trace};
use xds_crypto::Hash;
use xds_primitives::{BlockHeader, NetworkParams};

use crate::error::ConsensusError;

/// Validation progress of a header in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationState {
    HeaderValidated,
    /// Under a checkpoint; body rules are skipped.
    AssumedValid,
    PartiallyValidated,
    FullyValidated,
    Invalid,
}

/// A header linked into the tree.
///
/// Parents are owned (`Arc` up-links); children are reachable only
/// through the indexer's lookup maps, so pruning a subtree drops it.
pub struct ChainedHeader {
    pub header: BlockHeader,
    pub hash: Hash<32>,
    pub height: u64,
    /// Cumulative work from genesis, inclusive.
    pub chain_work: BigUint,
    parent: Option<Arc<ChainedHeader>>,
    state: RwLock<ValidationState>,
}

impl ChainedHeader {
    fn genesis(header: BlockHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.hash(),
            height: 0,
            chain_work: header.bits.work(),
            header,
            parent: None,
            state: RwLock::new(ValidationState::FullyValidated),
        })
    }

    fn child_of(parent: &Arc<ChainedHeader>, header: BlockHeader) -> Arc<Self> {
        Arc::new(Self {
            hash: header.hash(),
            height: parent.height + 1,
            chain_work: &parent.chain_work + header.bits.work(),
            header,
            parent: Some(parent.clone()),
            state: RwLock::new(ValidationState::HeaderValidated),
        })
    }

    pub fn parent(&self) -> Option<&Arc<ChainedHeader>> {
        self.parent.as_ref()
    }

    pub fn state(&self) -> ValidationState {
        *self.state.read().expect("lock is never poisoned")
    }

    pub fn set_state(&self, state: ValidationState) {
        *self.state.write().expect("lock is never poisoned") = state;
    }

    pub fn is_invalid(&self) -> bool {
        self.state() == ValidationState::Invalid
    }

    /// Walk up to the ancestor at `height`.
    pub fn ancestor_at(self: &Arc<Self>, height: u64) -> Option<Arc<ChainedHeader>> {
        if height > self.height {
            return None;
        }

        let mut cursor = self.clone();
        while cursor.height > height {
            cursor = cursor.parent.as_ref()?.clone();
        }

        Some(cursor)
    }
}

impl std::fmt::Debug for ChainedHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedHeader")
            .field("hash", &self.hash)
            .field("height", &self.height)
            .field("state", &self.state())
            .finish()
    }
}

struct IndexState {
    by_hash: HashMap<Hash<32>, Arc<ChainedHeader>>,
    children: HashMap<Hash<32>, Vec<Hash<32>>>,
    /// Best chain by height; `best[0]` is genesis.
    best: Vec<Arc<ChainedHeader>>,
}

/// Header tree rooted at genesis plus the current best chain.
pub struct ChainIndexer {
    state: RwLock<IndexState>,
}

impl ChainIndexer {
    /// Build the index with the network's genesis at the root.
    pub fn new(params: &NetworkParams) -> Self {
        let genesis_header = BlockHeader {
            version: params.genesis_version,
            prev_hash: Hash::ZERO,
            merkle_root: params.genesis_merkle_root,
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        };

        let genesis = ChainedHeader::genesis(genesis_header);
        debug!(hash = %genesis.hash, "indexed genesis");

        let mut by_hash = HashMap::new();
        by_hash.insert(genesis.hash, genesis.clone());

        Self {
            state: RwLock::new(IndexState {
                by_hash,
                children: HashMap::new(),
                best: vec![genesis],
            }),
        }
    }

    pub fn tip(&self) -> Arc<ChainedHeader> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .best
            .last()
            .expect("best chain always holds genesis")
            .clone()
    }

    pub fn genesis(&self) -> Arc<ChainedHeader> {
        self.state.read().expect("lock is never poisoned").best[0].clone()
    }

    pub fn get_by_hash(&self, hash: &Hash<32>) -> Option<Arc<ChainedHeader>> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .by_hash
            .get(hash)
            .cloned()
    }

    pub fn get_by_height(&self, height: u64) -> Option<Arc<ChainedHeader>> {
        self.state
            .read()
            .expect("lock is never poisoned")
            .best
            .get(height as usize)
            .cloned()
    }

    /// Link a header under its parent. Fails with `HeaderInvalid` when
    /// the parent is unknown or itself invalid.
    pub fn connect(&self, header: BlockHeader) -> Result<Arc<ChainedHeader>, ConsensusError> {
        let mut state = self.state.write().expect("lock is never poisoned");

        let hash = header.hash();
        if let Some(existing) = state.by_hash.get(&hash) {
            return Ok(existing.clone());
        }

        let parent = state
            .by_hash
            .get(&header.prev_hash)
            .ok_or(ConsensusError::HeaderInvalid)?
            .clone();

        if parent.is_invalid() {
            return Err(ConsensusError::KnownInvalid);
        }

        let chained = ChainedHeader::child_of(&parent, header);
        trace!(hash = %chained.hash, height = chained.height, "connected header");

        state.by_hash.insert(chained.hash, chained.clone());
        state
            .children
            .entry(parent.hash)
            .or_default()
            .push(chained.hash);

        Ok(chained)
    }

    /// Lowest common ancestor of `other` and the best chain tip.
    pub fn find_fork(&self, other: &Arc<ChainedHeader>) -> Arc<ChainedHeader> {
        let state = self.state.read().expect("lock is never poisoned");

        let mut cursor = other.clone();
        loop {
            match state.best.get(cursor.height as usize) {
                Some(on_best) if on_best.hash == cursor.hash => return cursor,
                _ => {
                    cursor = cursor
                        .parent()
                        .expect("walk reaches genesis, which is on the best chain")
                        .clone();
                }
            }
        }
    }

    /// `true` when `header` lies on the current best chain.
    pub fn is_on_best_chain(&self, header: &Arc<ChainedHeader>) -> bool {
        self.state
            .read()
            .expect("lock is never poisoned")
            .best
            .get(header.height as usize)
            .is_some_and(|on_best| on_best.hash == header.hash)
    }

    /// Rewire the best chain to end at `new_tip`. Non-ancestor nodes
    /// of the old chain stay reachable by hash as side-chain headers.
    pub fn set_tip(&self, new_tip: &Arc<ChainedHeader>) {
        let mut state = self.state.write().expect("lock is never poisoned");

        // collect the new path from tip back to the first node that
        // already matches the best chain
        let mut path = Vec::new();
        let mut cursor = new_tip.clone();

        loop {
            let on_best = state
                .best
                .get(cursor.height as usize)
                .is_some_and(|h| h.hash == cursor.hash);

            if on_best {
                break;
            }

            path.push(cursor.clone());

            cursor = match cursor.parent() {
                Some(parent) => parent.clone(),
                None => break,
            };
        }

        state.best.truncate(cursor.height as usize + 1);
        state.best.extend(path.into_iter().rev());

        debug!(tip = %new_tip.hash, height = new_tip.height, "best chain updated");
    }

    /// Mark a header and all its descendants invalid, returning the
    /// marked hashes.
    pub fn invalidate_subtree(&self, root: &Hash<32>) -> Vec<Hash<32>> {
        let state = self.state.read().expect("lock is never poisoned");

        let mut marked = Vec::new();
        let mut queue = vec![*root];

        while let Some(hash) = queue.pop() {
            if let Some(header) = state.by_hash.get(&hash) {
                header.set_state(ValidationState::Invalid);
                marked.push(hash);
            }

            if let Some(children) = state.children.get(&hash) {
                queue.extend(children.iter().copied());
            }
        }

        marked
    }

    pub fn header_count(&self) -> usize {
        self.state
            .read()
            .expect("lock is never poisoned")
            .by_hash
            .len()
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    fn indexer() -> ChainIndexer {
        ChainIndexer::new(&NetworkParams::mainnet())
    }

    #[test]
    fn genesis_is_the_initial_tip() {
        let index = indexer();
        let tip = index.tip();

        assert_eq!(tip.height, 0);
        assert_eq!(index.get_by_height(0).unwrap().hash, tip.hash);
        assert_eq!(index.header_count(), 1);
    }

    #[test]
    fn connect_links_contiguous_heights() {
        let index = indexer();
        let tip = extend(&index, &index.genesis(), 3, 1);

        index.set_tip(&tip);

        assert_eq!(index.tip().height, 3);
        for height in 0..=3 {
            let header = index.get_by_height(height).unwrap();
            assert_eq!(header.height, height);
            if height > 0 {
                assert_eq!(
                    header.parent().unwrap().hash,
                    index.get_by_height(height - 1).unwrap().hash
                );
            }
        }
    }

    #[test]
    fn connect_requires_known_parent() {
        let index = indexer();
        let orphan = BlockHeader {
            prev_hash: Hash::new([0xee; 32]),
            ..header_on(&index.genesis(), 1)
        };

        assert_eq!(
            index.connect(orphan).unwrap_err(),
            ConsensusError::HeaderInvalid
        );
    }

    #[test]
    fn chain_work_is_monotonic_along_best_chain() {
        let index = indexer();
        let tip = extend(&index, &index.genesis(), 5, 1);
        index.set_tip(&tip);

        for height in 1..=5 {
            let prev = index.get_by_height(height - 1).unwrap();
            let this = index.get_by_height(height).unwrap();
            assert!(this.chain_work > prev.chain_work);
        }
    }

    #[test]
    fn find_fork_locates_branch_point() {
        let index = indexer();
        let trunk = extend(&index, &index.genesis(), 4, 1);
        index.set_tip(&trunk);

        let branch_base = index.get_by_height(2).unwrap();
        let side = extend(&index, &branch_base, 3, 2);

        let fork = index.find_fork(&side);
        assert_eq!(fork.hash, branch_base.hash);

        // a node on the best chain is its own fork point
        assert_eq!(index.find_fork(&trunk).hash, trunk.hash);
    }

    #[test]
    fn set_tip_switches_to_side_chain() {
        let index = indexer();
        let trunk = extend(&index, &index.genesis(), 4, 1);
        index.set_tip(&trunk);

        let branch_base = index.get_by_height(2).unwrap();
        let side = extend(&index, &branch_base, 4, 2);
        index.set_tip(&side);

        assert_eq!(index.tip().hash, side.hash);
        assert_eq!(index.tip().height, 6);
        assert_eq!(
            index.get_by_height(5).unwrap().hash,
            side.parent().unwrap().hash
        );

        // the old trunk stays reachable by hash
        assert!(index.get_by_hash(&trunk.hash).is_some());
        assert!(!index.is_on_best_chain(&trunk));
    }

    #[test]
    fn invalidate_subtree_marks_descendants() {
        let index = indexer();
        let trunk = extend(&index, &index.genesis(), 3, 1);

        let marked = index.invalidate_subtree(&index.get_by_height(0).unwrap().hash);
        // genesis is height 0 on best; we invalidated from genesis so
        // every connected header is marked
        assert_eq!(marked.len(), 4);
        assert!(trunk.is_invalid());

        // connecting under an invalid parent is refused
        let next = header_on(&trunk, 9);
        assert_eq!(
            index.connect(next).unwrap_err(),
            ConsensusError::KnownInvalid
        );
    }

    #[test]
    fn ancestor_walk() {
        let index = indexer();
        let tip = extend(&index, &index.genesis(), 6, 1);

        let ancestor = tip.ancestor_at(2).unwrap();
        assert_eq!(ancestor.height, 2);
        assert!(tip.ancestor_at(7).is_none());
    }
}
