//! Persistent chain store: blocks, transactions and the head pointer.
//!
//! Write ordering is load-bearing: block bytes land before the height
//! index, which lands before `latest`, so a crash never leaves the head
//! pointing at a missing block. Rollback repoints `latest` first and only
//! then deletes, for the same reason.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block::types::{merkle_root, Block, BlockHeader};
use crate::keys;
use crate::kv::{keyspace, KvStore, StoreError};
use crate::types::{now_ms, DelayParams, Transaction, VoteMap};

const BLOCK_CACHE_SIZE: usize = 500;
const TX_CACHE_SIZE: usize = 30_000;
const HEIGHT_CACHE_SIZE: usize = 2_000;

#[derive(serde::Serialize, serde::Deserialize)]
struct LatestPointer {
    hash: String,
}

/// Identity of the local packager, stamped into coinbases.
#[derive(Clone, Debug)]
pub struct Packager {
    pub address: String,
    pub pub_key: String,
    pub reward: u64,
}

pub struct ChainStore {
    kv: Arc<KvStore>,
    block_cache: Mutex<LruCache<String, Block>>,
    height_cache: Mutex<LruCache<u64, String>>,
    tx_cache: Mutex<LruCache<String, Transaction>>,
    genesis_ts: Mutex<Option<u64>>,
}

impl ChainStore {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self {
            kv,
            block_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("nonzero"),
            )),
            height_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HEIGHT_CACHE_SIZE).expect("nonzero"),
            )),
            tx_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(TX_CACHE_SIZE).expect("nonzero"),
            )),
            genesis_ts: Mutex::new(None),
        }
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    /// Head block and its hash, if any block has been committed yet.
    pub fn latest(&self) -> Result<Option<(Block, String)>, StoreError> {
        let Some(pointer) = self.kv.get::<LatestPointer>(keyspace::LATEST)? else {
            return Ok(None);
        };
        match self.block_by_hash(&pointer.hash)? {
            Some(block) => Ok(Some((block, pointer.hash))),
            None => {
                warn!(hash = %pointer.hash, "Head pointer references missing block");
                Ok(None)
            }
        }
    }

    pub fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self.latest()?.map(|(block, _)| block.height()))
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, StoreError> {
        if hash.is_empty() {
            return Ok(None);
        }
        if let Some(block) = self.block_cache.lock().get(hash) {
            return Ok(Some(block.clone()));
        }
        let loaded = self.kv.get::<Block>(&keyspace::block_by_hash(hash))?;
        if let Some(block) = &loaded {
            self.block_cache.lock().put(hash.to_string(), block.clone());
        }
        Ok(loaded)
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, StoreError> {
        let cached = self.height_cache.lock().get(&height).cloned();
        let hash = match cached {
            Some(hash) => hash,
            None => {
                let Some(hash) = self.kv.get::<String>(&keyspace::block_by_height(height))? else {
                    return Ok(None);
                };
                self.height_cache.lock().put(height, hash.clone());
                hash
            }
        };
        self.block_by_hash(&hash)
    }

    pub fn transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, StoreError> {
        if let Some(tx) = self.tx_cache.lock().get(tx_hash) {
            return Ok(Some(tx.clone()));
        }
        let loaded = self.kv.get::<Transaction>(&keyspace::tx(tx_hash))?;
        if let Some(tx) = &loaded {
            self.tx_cache.lock().put(tx_hash.to_string(), tx.clone());
        }
        Ok(loaded)
    }

    /// Millisecond timestamp of the genesis block, memoized.
    pub fn genesis_timestamp(&self) -> Result<Option<u64>, StoreError> {
        if let Some(ts) = *self.genesis_ts.lock() {
            return Ok(Some(ts));
        }
        let Some(genesis) = self.block_by_height(0)? else {
            return Ok(None);
        };
        let ts = genesis.header.timestamp;
        *self.genesis_ts.lock() = Some(ts);
        Ok(Some(ts))
    }

    /// VDF parameters of the head coinbase.
    pub fn latest_delay_params(&self) -> Result<Option<DelayParams>, StoreError> {
        let Some((block, _)) = self.latest()? else {
            return Ok(None);
        };
        Ok(block.delay_params().cloned())
    }

    /// Persist a block: body, per-tx records, height index, head pointer —
    /// in that order. Re-inserting a known block is a no-op success.
    pub fn insert_block(&self, block: &Block) -> Result<(), StoreError> {
        let hash = block.hash().to_string();
        let height = block.height();
        info!(%hash, height, "Insert block");

        self.kv.create(&keyspace::block_by_hash(&hash), block)?;
        for tx in &block.transactions {
            self.kv.put(&keyspace::tx(&tx.tx_hash), tx)?;
        }
        self.kv.put(&keyspace::block_by_height(height), &hash)?;
        self.kv.put(
            keyspace::LATEST,
            &LatestPointer { hash: hash.clone() },
        )?;

        let mut blocks = self.block_cache.lock();
        blocks.put(hash.clone(), block.clone());
        drop(blocks);
        self.height_cache.lock().put(height, hash);
        let mut txs = self.tx_cache.lock();
        for tx in &block.transactions {
            txs.put(tx.tx_hash.clone(), tx.clone());
        }
        Ok(())
    }

    /// Drop the head block, repointing `latest` at its predecessor.
    /// Returns the removed block.
    pub fn rollback(&self) -> Result<Option<Block>, StoreError> {
        let Some((head, head_hash)) = self.latest()? else {
            return Ok(None);
        };
        let height = head.height();
        info!(hash = %head_hash, height, "Rollback block");

        // Caches first, so no reader resurrects the removed height.
        self.block_cache.lock().pop(&head_hash);
        self.height_cache.lock().pop(&height);
        {
            let mut txs = self.tx_cache.lock();
            for tx in &head.transactions {
                txs.pop(&tx.tx_hash);
            }
        }

        if height == 0 {
            self.kv.delete(keyspace::LATEST)?;
            *self.genesis_ts.lock() = None;
        } else {
            self.kv.put(
                keyspace::LATEST,
                &LatestPointer {
                    hash: head.header.prev_hash.clone(),
                },
            )?;
        }
        self.kv.delete(&keyspace::block_by_height(height))?;
        self.kv.delete(&keyspace::block_by_hash(&head_hash))?;
        for tx in &head.transactions {
            self.kv.delete(&keyspace::tx(&tx.tx_hash))?;
        }
        Ok(Some(head))
    }

    /// Signature validation for every non-coinbase transaction of a block.
    /// A missing previous transaction fails verification without being an
    /// error.
    pub fn verify_block(&self, block: &Block) -> Result<bool, StoreError> {
        for tx in &block.transactions {
            if !self.verify_transaction(tx)? {
                warn!(tx = %tx.tx_hash, "Block verification failed");
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, StoreError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        for (idx, input) in tx.inputs.iter().enumerate() {
            let Some(prev) = self.transaction_by_hash(&input.tx_hash)? else {
                debug!(tx = %tx.tx_hash, prev = %input.tx_hash, "Previous transaction missing");
                return Ok(false);
            };
            let Some(output) = usize::try_from(input.index)
                .ok()
                .and_then(|i| prev.outputs.get(i))
            else {
                return Ok(false);
            };
            let (Some(signature), Some(pub_key)) = (&input.signature, &input.pub_key) else {
                return Ok(false);
            };
            let digest = tx.signing_digest(idx, &output.pub_key_hash);
            if !keys::verify(pub_key, digest.as_bytes(), signature) {
                debug!(tx = %tx.tx_hash, input = idx, "Signature mismatch");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Assemble a candidate block for the next height from already-verified
    /// mempool transactions plus a fresh coinbase. Transactions that double
    /// spend an outpoint already used inside this package are dropped.
    pub fn package_new_block(
        &self,
        transactions: Vec<Transaction>,
        vote_info: VoteMap,
        delay_params: DelayParams,
        packager: &Packager,
    ) -> Result<Option<Block>, StoreError> {
        let Some((prev, prev_hash)) = self.latest()? else {
            warn!("Cannot package without a genesis block");
            return Ok(None);
        };
        let height = prev.height() + 1;
        let timestamp = now_ms().max(prev.header.timestamp + 1);

        let coinbase = Transaction::coinbase(
            vote_info,
            delay_params,
            &packager.pub_key,
            packager.reward,
            &packager.address,
            timestamp,
        );

        let mut used: HashSet<(String, i64)> = HashSet::new();
        let mut txs = vec![coinbase];
        for tx in transactions {
            let conflict = tx
                .inputs
                .iter()
                .any(|i| used.contains(&(i.tx_hash.clone(), i.index)));
            if conflict {
                debug!(tx = %tx.tx_hash, "Dropping package-internal double spend");
                continue;
            }
            for input in &tx.inputs {
                used.insert((input.tx_hash.clone(), input.index));
            }
            txs.push(tx);
        }

        let mut header = BlockHeader::new(merkle_root(&txs), height, prev_hash, timestamp);
        header.seal();
        let block = Block::new(header, txs);

        if !self.verify_block(&block)? {
            warn!(height, "Packaged block failed verification");
            return Ok(None);
        }
        Ok(Some(block))
    }
}
