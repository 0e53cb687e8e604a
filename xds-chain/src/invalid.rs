//! Bounded memory of block hashes that failed validation, so a bad
//! body is never fetched twice.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use xds_crypto::Hash;

const DEFAULT_CAPACITY: usize = 1000;

/// FIFO-bounded set of invalid block hashes.
pub struct InvalidBlockHashStore {
    state: Mutex<Inner>,
}

struct Inner {
    set: HashSet<Hash<32>>,
    order: VecDeque<Hash<32>>,
    capacity: usize,
}

impl InvalidBlockHashStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(Inner {
                set: HashSet::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    pub fn mark(&self, hash: Hash<32>) {
        let mut inner = self.state.lock().expect("lock is never poisoned");

        if !inner.set.insert(hash) {
            return;
        }

        inner.order.push_back(hash);

        while inner.order.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.set.remove(&evicted);
            }
        }
    }

    pub fn contains(&self, hash: &Hash<32>) -> bool {
        self.state
            .lock()
            .expect("lock is never poisoned")
            .set
            .contains(hash)
    }
}

impl Default for InvalidBlockHashStore {
    fn default() -> Self {
        Self::new()
    }
}
