//! Core-side contract for wallet-facing front-ends.
//!
//! The HTTP surface lives outside the core; this is the typed boundary it
//! calls into: transaction submission, chain and UTXO lookups, and a node
//! status snapshot.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::block::types::Block;
use crate::chain::ChainStore;
use crate::kv::StoreError;
use crate::mempool::Mempool;
use crate::network::gossip::GossipBus;
use crate::network::manager::Manager;
use crate::round::RoundTimer;
use crate::types::{Transaction, UtxoEntry};
use crate::utxo::UtxoSet;
use crate::vote::VoteCenter;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeStatus {
    pub height: i64,
    pub mempool_size: usize,
    pub round_height: u64,
    pub has_voted: bool,
    pub vote_count: usize,
    pub peers: usize,
}

pub struct NodeApi {
    chain: Arc<ChainStore>,
    utxo: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    votes: Arc<VoteCenter>,
    timer: Arc<RoundTimer>,
    gossip: Arc<GossipBus>,
    manager: Arc<Manager>,
}

impl NodeApi {
    pub fn new(
        chain: Arc<ChainStore>,
        utxo: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        votes: Arc<VoteCenter>,
        timer: Arc<RoundTimer>,
        gossip: Arc<GossipBus>,
        manager: Arc<Manager>,
    ) -> Self {
        Self {
            chain,
            utxo,
            mempool,
            votes,
            timer,
            gossip,
            manager,
        }
    }

    /// Admit a signed transaction and hand it to the gossip bus.
    pub async fn submit(&self, tx: Transaction) -> Result<(), ApiError> {
        if tx.is_coinbase() {
            return Err(ApiError::Rejected("coinbase cannot be submitted".into()));
        }
        if tx.tx_hash != tx.compute_hash(None) {
            return Err(ApiError::Rejected("tx_hash does not match body".into()));
        }
        if !self.chain.verify_transaction(&tx)? {
            return Err(ApiError::Rejected("signature verification failed".into()));
        }
        if !self.gossip.submit(tx).await {
            return Err(ApiError::Rejected("duplicate or pool full".into()));
        }
        Ok(())
    }

    /// Committed transaction lookup, falling back to the mempool.
    pub fn transaction_by_hash(&self, tx_hash: &str) -> Result<Option<Transaction>, ApiError> {
        if let Some(tx) = self.chain.transaction_by_hash(tx_hash)? {
            return Ok(Some(tx));
        }
        Ok(self.mempool.get(tx_hash))
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, ApiError> {
        Ok(self.chain.block_by_height(height)?)
    }

    pub fn block_by_hash(&self, hash: &str) -> Result<Option<Block>, ApiError> {
        Ok(self.chain.block_by_hash(hash)?)
    }

    pub fn latest_block(&self) -> Result<Option<Block>, ApiError> {
        Ok(self.chain.latest()?.map(|(block, _)| block))
    }

    pub fn address_utxos(&self, address: &str) -> Result<BTreeMap<String, UtxoEntry>, ApiError> {
        Ok(self.utxo.find_by_address(address)?)
    }

    pub fn balance(&self, address: &str) -> Result<u64, ApiError> {
        Ok(self.utxo.balance(address)?)
    }

    pub fn status(&self) -> Result<NodeStatus, ApiError> {
        let height = self
            .chain
            .latest_height()?
            .map(|h| h as i64)
            .unwrap_or(-1);
        Ok(NodeStatus {
            height,
            mempool_size: self.mempool.len(),
            round_height: self.timer.next_height(),
            has_voted: self.votes.has_voted(),
            vote_count: self.votes.snapshot().values().map(Vec::len).sum(),
            peers: self.manager.session_count(),
        })
    }
}
