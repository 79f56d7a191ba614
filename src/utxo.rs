//! Derived index of unspent outputs.
//!
//! Primary records live under `utxo#<txhash>#<index>`; a per-address
//! secondary set under `utxo#<address>` keeps wallet lookups cheap. One
//! sled batch per block keeps application and rollback atomic.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block::types::Block;
use crate::chain::ChainStore;
use crate::keys;
use crate::kv::{keyspace, KvBatch, KvStore, StoreError};
use crate::types::{utxo_key, UtxoEntry};

const ADDRESS_CACHE_SIZE: usize = 1_000;

/// Persisted form of a per-address secondary set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressUtxos {
    pub utxos: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct UtxoHeight {
    height: u64,
}

pub struct UtxoSet {
    kv: Arc<KvStore>,
    /// address -> (utxo key -> entry); evicted sets are written back.
    addr_cache: Mutex<LruCache<String, BTreeMap<String, UtxoEntry>>>,
}

impl UtxoSet {
    pub fn new(kv: Arc<KvStore>) -> Self {
        Self {
            kv,
            addr_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(ADDRESS_CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    /// Height up to which this index has been applied.
    pub fn latest_height(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .kv
            .get::<UtxoHeight>(keyspace::UTXO_LATEST)?
            .map(|h| h.height))
    }

    /// Bring the index in sync with the chain: full replay when the index
    /// has never been built, forward application of missing blocks
    /// otherwise.
    pub fn reindex(&self, chain: &ChainStore) -> Result<(), StoreError> {
        let Some(chain_height) = chain.latest_height()? else {
            return Ok(());
        };
        let start = match self.latest_height()? {
            None => {
                info!(chain_height, "Rebuilding UTXO index from genesis");
                0
            }
            Some(h) if h >= chain_height => return Ok(()),
            Some(h) => h + 1,
        };
        for height in start..=chain_height {
            let Some(block) = chain.block_by_height(height)? else {
                warn!(height, "Missing block during reindex");
                break;
            };
            self.apply(&block)?;
        }
        Ok(())
    }

    /// Apply a committed block: add its outputs, then consume the outputs
    /// its inputs spend. Everything lands in one batch.
    pub fn apply(&self, block: &Block) -> Result<(), StoreError> {
        debug!(height = block.height(), "Apply block to UTXO set");
        let mut batch = KvBatch::new();
        let mut sets = SetStaging::default();

        for tx in &block.transactions {
            for (idx, output) in tx.outputs.iter().enumerate() {
                let entry = UtxoEntry {
                    value: output.value,
                    owner: output.pub_key_hash.clone(),
                    tx_hash: tx.tx_hash.clone(),
                    index: idx as u32,
                };
                batch.put(&keyspace::utxo(&tx.tx_hash, idx as u32), &entry)?;
                sets.load(self, &output.pub_key_hash)?;
                sets.add(&output.pub_key_hash, entry);
            }

            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                let index = match u32::try_from(input.index) {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let key = keyspace::utxo(&input.tx_hash, index);
                let owner = match self.kv.get::<UtxoEntry>(&key)? {
                    Some(entry) => entry.owner,
                    None => {
                        // Spent output unknown to the index; fall back to the
                        // spender's own address for set pruning.
                        match input
                            .pub_key
                            .as_deref()
                            .and_then(keys::address_from_pubkey_hex)
                        {
                            Some(addr) => addr,
                            None => continue,
                        }
                    }
                };
                batch.delete(&key);
                sets.load(self, &owner)?;
                sets.remove(&owner, &utxo_key(&input.tx_hash, index));
            }
        }

        sets.stage(&mut batch)?;
        batch.put(
            keyspace::UTXO_LATEST,
            &UtxoHeight {
                height: block.height(),
            },
        )?;
        self.kv.apply(batch)?;
        sets.commit(self);
        Ok(())
    }

    /// Inverse of [`apply`]: remove this block's outputs and restore the
    /// outputs its inputs spent, resolved through the chain store.
    pub fn rollback(&self, block: &Block, chain: &ChainStore) -> Result<(), StoreError> {
        info!(height = block.height(), "Roll back block from UTXO set");
        let mut batch = KvBatch::new();
        let mut sets = SetStaging::default();
        let block_txs: HashSet<&str> = block
            .transactions
            .iter()
            .map(|tx| tx.tx_hash.as_str())
            .collect();

        for tx in &block.transactions {
            for (idx, output) in tx.outputs.iter().enumerate() {
                batch.delete(&keyspace::utxo(&tx.tx_hash, idx as u32));
                sets.load(self, &output.pub_key_hash)?;
                sets.remove(&output.pub_key_hash, &utxo_key(&tx.tx_hash, idx as u32));
            }

            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                // Outputs produced inside this same block stay gone.
                if block_txs.contains(input.tx_hash.as_str()) {
                    continue;
                }
                let index = match u32::try_from(input.index) {
                    Ok(i) => i,
                    Err(_) => continue,
                };
                let Some(prev) = chain.transaction_by_hash(&input.tx_hash)? else {
                    warn!(prev = %input.tx_hash, "Producing tx missing during rollback");
                    continue;
                };
                let Some(output) = prev.outputs.get(index as usize) else {
                    continue;
                };
                let entry = UtxoEntry {
                    value: output.value,
                    owner: output.pub_key_hash.clone(),
                    tx_hash: input.tx_hash.clone(),
                    index,
                };
                batch.put(&keyspace::utxo(&input.tx_hash, index), &entry)?;
                sets.load(self, &output.pub_key_hash)?;
                sets.add(&output.pub_key_hash, entry);
            }
        }

        sets.stage(&mut batch)?;
        if block.height() == 0 {
            batch.delete(keyspace::UTXO_LATEST);
        } else {
            batch.put(
                keyspace::UTXO_LATEST,
                &UtxoHeight {
                    height: block.height() - 1,
                },
            )?;
        }
        self.kv.apply(batch)?;
        sets.commit(self);
        Ok(())
    }

    /// All unspent outputs owned by `address`, keyed by `txhash#index`.
    pub fn find_by_address(
        &self,
        address: &str,
    ) -> Result<BTreeMap<String, UtxoEntry>, StoreError> {
        if let Some(map) = self.addr_cache.lock().get(address) {
            return Ok(map.clone());
        }
        let map = self.load_address_map(address)?;
        self.cache_insert(address.to_string(), map.clone());
        Ok(map)
    }

    pub fn balance(&self, address: &str) -> Result<u64, StoreError> {
        Ok(self
            .find_by_address(address)?
            .values()
            .map(|e| e.value)
            .sum())
    }

    fn load_address_map(&self, address: &str) -> Result<BTreeMap<String, UtxoEntry>, StoreError> {
        let mut map = BTreeMap::new();
        let set = self
            .kv
            .get::<AddressUtxos>(&keyspace::utxo_address(address))?
            .unwrap_or_default();
        for key in set.utxos {
            let Some((tx_hash, index)) = split_utxo_key(&key) else {
                continue;
            };
            if let Some(entry) = self.kv.get::<UtxoEntry>(&keyspace::utxo(tx_hash, index))? {
                map.insert(key, entry);
            }
        }
        Ok(map)
    }

    /// Insert into the address cache; an evicted set is written back to the
    /// store before the entry disappears.
    fn cache_insert(&self, address: String, map: BTreeMap<String, UtxoEntry>) {
        let evicted = self.addr_cache.lock().push(address.clone(), map);
        if let Some((evicted_addr, evicted_map)) = evicted {
            if evicted_addr == address {
                return;
            }
            let set = AddressUtxos {
                utxos: evicted_map.keys().cloned().collect(),
            };
            if let Err(e) = self.kv.put(&keyspace::utxo_address(&evicted_addr), &set) {
                warn!(address = %evicted_addr, error = %e, "Write-back of evicted address set failed");
            }
        }
    }
}

/// In-flight edits to per-address sets during one block's batch.
#[derive(Default)]
struct SetStaging {
    sets: HashMap<String, BTreeMap<String, UtxoEntry>>,
}

impl SetStaging {
    fn load(&mut self, utxo: &UtxoSet, address: &str) -> Result<(), StoreError> {
        if self.sets.contains_key(address) {
            return Ok(());
        }
        let map = match utxo.addr_cache.lock().get(address) {
            Some(map) => map.clone(),
            None => utxo.load_address_map(address)?,
        };
        self.sets.insert(address.to_string(), map);
        Ok(())
    }

    fn add(&mut self, address: &str, entry: UtxoEntry) {
        if let Some(map) = self.sets.get_mut(address) {
            map.insert(entry.key(), entry);
        }
    }

    fn remove(&mut self, address: &str, key: &str) {
        if let Some(map) = self.sets.get_mut(address) {
            map.remove(key);
        }
    }

    fn stage(&self, batch: &mut KvBatch) -> Result<(), StoreError> {
        for (address, map) in &self.sets {
            let set = AddressUtxos {
                utxos: map.keys().cloned().collect(),
            };
            batch.put(&keyspace::utxo_address(address), &set)?;
        }
        Ok(())
    }

    fn commit(self, utxo: &UtxoSet) {
        for (address, map) in self.sets {
            utxo.cache_insert(address, map);
        }
    }
}

fn split_utxo_key(key: &str) -> Option<(&str, u32)> {
    let (tx_hash, index) = key.rsplit_once('#')?;
    Some((tx_hash, index.parse().ok()?))
}
