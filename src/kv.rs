//! Typed facade over the embedded sled store.
//!
//! One keyspace, partitioned by prefix:
//! `latest`, `block#<height>`, `block#<hash>`, `tx#<txhash>`,
//! `utxo#<txhash>#<index>`, `utxo#<address>`, `utxo#latest#0`, `wallets`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization failed: {0}")]
    Codec(#[from] bincode::Error),
}

/// Key builders for the shared namespace.
pub mod keyspace {
    pub const LATEST: &str = "latest";
    pub const UTXO_LATEST: &str = "utxo#latest#0";
    pub const WALLETS: &str = "wallets";

    pub fn block_by_height(height: u64) -> String {
        format!("block#{height}")
    }

    pub fn block_by_hash(hash: &str) -> String {
        format!("block#{hash}")
    }

    pub fn tx(tx_hash: &str) -> String {
        format!("tx#{tx_hash}")
    }

    pub fn utxo(tx_hash: &str, index: u32) -> String {
        format!("utxo#{tx_hash}#{index}")
    }

    pub fn utxo_address(address: &str) -> String {
        format!("utxo#{address}")
    }
}

pub struct KvStore {
    db: sled::Db,
}

impl KvStore {
    pub fn open(path: &Path, cache_mb: u64) -> Result<Self, StoreError> {
        let db = sled::Config::new()
            .path(path)
            .cache_capacity(cache_mb * 1024 * 1024)
            .flush_every_ms(Some(1000))
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Ok(Self { db })
    }

    /// Fetch and decode. Corrupted bytes count as absent (logged) so a bad
    /// record never wedges a reader.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.db.get(key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => match bincode::deserialize(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Discarding undecodable record");
                    Ok(None)
                }
            },
        }
    }

    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = bincode::serialize(value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Insert, reporting whether the key was fresh. A duplicate insert is
    /// treated as success.
    pub fn create<T: Serialize>(&self, key: &str, value: &T) -> Result<bool, StoreError> {
        let bytes = bincode::serialize(value)?;
        let prior = self.db.insert(key.as_bytes(), bytes)?;
        if prior.is_some() {
            tracing::debug!(key, "Record already present, keeping new value");
        }
        Ok(prior.is_none())
    }

    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.db.remove(key.as_bytes())?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.db.contains_key(key.as_bytes())?)
    }

    pub fn apply(&self, batch: KvBatch) -> Result<(), StoreError> {
        self.db.apply_batch(batch.inner)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Write set applied atomically via [`KvStore::apply`].
#[derive(Default)]
pub struct KvBatch {
    inner: sled::Batch,
}

impl KvBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        let bytes = bincode::serialize(value)?;
        self.inner.insert(key.as_bytes(), bytes);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) {
        self.inner.remove(key.as_bytes());
    }
}
