//! Transaction mempool with the package/rollback discipline.
//!
//! Two queues: `current` holds fresh arrivals, `prev` holds the hashes of
//! the last packaging attempt. A package drains `prev` first so a failed
//! round never loses transactions, while the height watermark stops the
//! same height from being packaged twice. The primary map only shrinks on
//! commit (`remove`) or eviction; queue entries are cleaned lazily.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::chain::ChainStore;
use crate::types::Transaction;

struct Inner {
    txs: HashMap<String, Transaction>,
    current: VecDeque<String>,
    prev: VecDeque<String>,
    /// Highest height already served by `package`.
    height: i64,
}

pub struct Mempool {
    inner: Mutex<Inner>,
    /// Held for write while a package snapshot is taken; `add` waits on the
    /// read side so the snapshot stays consistent.
    gate: RwLock<()>,
    chain: Arc<ChainStore>,
    size: usize,
}

impl Mempool {
    pub fn new(chain: Arc<ChainStore>, size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                txs: HashMap::new(),
                current: VecDeque::new(),
                prev: VecDeque::new(),
                height: -1,
            }),
            gate: RwLock::new(()),
            chain,
            size,
        }
    }

    /// Admit a pending transaction. Blocks while a local package is being
    /// formed; rejects duplicates, already-committed transactions and
    /// overflow beyond the configured size.
    pub async fn add(&self, tx: Transaction) -> bool {
        let _gate = self.gate.read().await;

        let already_committed = match self.chain.transaction_by_hash(&tx.tx_hash) {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(error = %e, "Chain lookup failed while admitting tx");
                return false;
            }
        };
        if already_committed {
            debug!(tx = %tx.tx_hash, "Transaction already committed");
            return false;
        }

        let mut inner = self.inner.lock();
        if inner.txs.contains_key(&tx.tx_hash) {
            debug!(tx = %tx.tx_hash, "Transaction already pooled");
            return false;
        }
        if inner.txs.len() >= self.size {
            warn!(size = self.size, "Mempool full, rejecting transaction");
            return false;
        }
        let hash = tx.tx_hash.clone();
        inner.txs.insert(hash.clone(), tx);
        inner.current.push_back(hash);
        true
    }

    /// Take up to SIZE transactions for the block at `target` height.
    /// Returns `None` when that height has already been packaged. Drained
    /// hashes move to the `prev` queue; map entries stay until committed.
    pub async fn package(&self, target: u64) -> Option<Vec<Transaction>> {
        let _gate = self.gate.write().await;
        let mut inner = self.inner.lock();

        if (target as i64) <= inner.height {
            debug!(watermark = inner.height, target, "Height already packaged");
            return None;
        }
        inner.height = target as i64;

        let mut pending: VecDeque<String> = std::mem::take(&mut inner.prev);
        pending.extend(std::mem::take(&mut inner.current));

        let mut result = Vec::new();
        let mut attempted = VecDeque::new();
        while let Some(hash) = pending.pop_front() {
            if result.len() >= self.size {
                // Put the untouched remainder back in arrival order.
                inner.current.push_back(hash);
                inner.current.extend(pending);
                break;
            }
            let Some(tx) = inner.txs.get(&hash).cloned() else {
                continue;
            };
            match self.chain.transaction_by_hash(&hash) {
                Ok(Some(_)) => {
                    inner.txs.remove(&hash);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, tx = %hash, "Lookup failed, keeping tx for retry");
                    inner.current.push_back(hash);
                    continue;
                }
            }
            match self.chain.verify_transaction(&tx) {
                Ok(true) => {
                    attempted.push_back(hash);
                    result.push(tx);
                }
                Ok(false) => {
                    warn!(tx = %hash, "Dropping unverifiable transaction");
                    inner.txs.remove(&hash);
                }
                Err(e) => {
                    warn!(error = %e, tx = %hash, "Verification errored, keeping tx for retry");
                    inner.current.push_back(hash);
                }
            }
        }
        inner.prev = attempted;

        debug!(count = result.len(), target, "Packaged transactions");
        Some(result)
    }

    /// Advance the watermark after a commit, or lower it after a rollback so
    /// the affected heights can be packaged again.
    pub fn set_height(&self, height: i64, rolled_back: bool) {
        let mut inner = self.inner.lock();
        if rolled_back {
            debug!(from = inner.height, to = height, "Watermark rolled back");
            inner.height = height;
        } else if height > inner.height {
            inner.height = height;
        }
    }

    /// Drop a committed transaction from the pool.
    pub fn remove(&self, tx_hash: &str) {
        let mut inner = self.inner.lock();
        if inner.txs.remove(tx_hash).is_some() {
            debug!(tx = %tx_hash, "Removed committed transaction");
        }
    }

    pub fn contains(&self, tx_hash: &str) -> bool {
        self.inner.lock().txs.contains_key(tx_hash)
    }

    pub fn get(&self, tx_hash: &str) -> Option<Transaction> {
        self.inner.lock().txs.get(tx_hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().txs.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().txs.len() >= self.size
    }

    pub fn watermark(&self) -> i64 {
        self.inner.lock().height
    }
}
