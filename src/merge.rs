//! Single-writer merge engine.
//!
//! Every path that changes the canonical head funnels through one worker:
//! genesis insert, head+1 append, fork rollback, and the re-queue dance for
//! blocks whose predecessors have not arrived. After each commit the
//! per-round refresh sequence runs before anything else can observe the new
//! head.

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::block::types::Block;
use crate::chain::ChainStore;
use crate::kv::StoreError;
use crate::mempool::Mempool;
use crate::round::RoundTimer;
use crate::selector::BlockSelector;
use crate::utxo::UtxoSet;
use crate::vdf::Calculator;
use crate::vote::VoteCenter;

const SEEN_CACHE_SIZE: usize = 1024;
const QUEUE_DEPTH: usize = 256;
const MAX_REQUEUES: u32 = 64;

/// Outcome reported to the submitter, mirroring what a peer session needs
/// to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Accepted (or already fully handled).
    Queued,
    /// The same unprocessed block is already waiting.
    Exists,
    /// The predecessor is unknown; the submitter should fetch it.
    PullPredecessor,
}

struct SeenEntry {
    processed: bool,
    prev_hash: String,
    requeues: u32,
}

struct MergeShared {
    seen: Mutex<LruCache<String, SeenEntry>>,
    chain: Arc<ChainStore>,
}

/// Cheap handle for feeding blocks into the engine.
#[derive(Clone)]
pub struct MergeHandle {
    tx: mpsc::Sender<Block>,
    shared: Arc<MergeShared>,
}

impl MergeHandle {
    /// Deduplicate and enqueue. The caller learns synchronously whether the
    /// block's ancestor is missing.
    pub fn submit(&self, block: Block) -> SubmitStatus {
        let hash = block.hash().to_string();
        let prev_hash = block.header.prev_hash.clone();
        let height = block.height();

        let prev_on_chain = self
            .shared
            .chain
            .block_by_hash(&prev_hash)
            .ok()
            .flatten()
            .is_some();

        let mut seen = self.shared.seen.lock();
        let prev_pending = seen.contains(&prev_hash);

        if height != 0 && !prev_on_chain && !prev_pending {
            debug!(%hash, height, "Predecessor unknown, requesting pull");
            return SubmitStatus::PullPredecessor;
        }

        if let Some(entry) = seen.get(&hash) {
            debug!(%hash, "Block already seen by merge engine");
            if entry.processed {
                return SubmitStatus::Queued;
            }
            return if prev_on_chain || prev_pending {
                SubmitStatus::Exists
            } else {
                SubmitStatus::PullPredecessor
            };
        }

        seen.put(
            hash.clone(),
            SeenEntry {
                processed: false,
                prev_hash,
                requeues: 0,
            },
        );
        drop(seen);

        if self.tx.try_send(block).is_err() {
            warn!(%hash, "Merge queue full, dropping block");
            self.shared.seen.lock().pop(&hash);
            return SubmitStatus::Exists;
        }
        debug!(%hash, height, "Block queued for merge");
        SubmitStatus::Queued
    }

    pub fn is_known(&self, hash: &str) -> bool {
        self.shared.seen.lock().contains(hash)
    }
}

pub struct MergeEngine {
    rx: Mutex<Option<mpsc::Receiver<Block>>>,
    requeue_tx: mpsc::Sender<Block>,
    shared: Arc<MergeShared>,
    chain: Arc<ChainStore>,
    utxo: Arc<UtxoSet>,
    mempool: Arc<Mempool>,
    votes: Arc<VoteCenter>,
    timer: Arc<RoundTimer>,
    calculator: Arc<Calculator>,
    selector: Arc<BlockSelector>,
}

impl MergeEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainStore>,
        utxo: Arc<UtxoSet>,
        mempool: Arc<Mempool>,
        votes: Arc<VoteCenter>,
        timer: Arc<RoundTimer>,
        calculator: Arc<Calculator>,
        selector: Arc<BlockSelector>,
        handle_slot: MergeHandleSlot,
    ) -> (Arc<Self>, MergeHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let shared = Arc::new(MergeShared {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(SEEN_CACHE_SIZE).expect("nonzero"),
            )),
            chain: chain.clone(),
        });
        let handle = MergeHandle {
            tx: tx.clone(),
            shared: shared.clone(),
        };
        handle_slot.fill(handle.clone());
        let engine = Arc::new(Self {
            rx: Mutex::new(Some(rx)),
            requeue_tx: tx,
            shared,
            chain,
            utxo,
            mempool,
            votes,
            timer,
            calculator,
            selector,
        });
        (engine, handle)
    }

    /// Worker loop: pull one block at a time and run the state machine. A
    /// failure skips the block, never the loop.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.rx.lock().take() else {
            warn!("Merge worker already running");
            return;
        };
        loop {
            let block = tokio::select! {
                block = rx.recv() => block,
                _ = shutdown.cancelled() => return,
            };
            let Some(block) = block else { return };
            if let Err(e) = self.process_block(block).await {
                warn!(error = %e, "Merge step failed, skipping block");
            }
        }
    }

    /// One step of the state machine. Public so tests can drive the engine
    /// without the worker task.
    pub async fn process_block(&self, block: Block) -> Result<(), StoreError> {
        let hash = block.hash().to_string();
        let height = block.height();
        let prev_hash = block.header.prev_hash.clone();

        if let Some(entry) = self.shared.seen.lock().get_mut(&hash) {
            entry.processed = true;
        }

        let Some((latest, latest_hash)) = self.chain.latest()? else {
            if height == 0 {
                info!(%hash, "Committing genesis block");
                self.commit(&block, false).await?;
            } else {
                debug!(%hash, height, "No genesis yet, dropping non-genesis block");
            }
            return Ok(());
        };
        let latest_height = latest.height();

        if height <= latest_height {
            let Some(equal) = self.chain.block_by_height(height)? else {
                warn!(height, "Height index hole, dropping block");
                return Ok(());
            };
            if hash == equal.header.hash
                || prev_hash != equal.header.prev_hash
                || !block.beats(&equal)
            {
                debug!(%hash, height, "Competing block does not beat canonical");
                return Ok(());
            }

            info!(
                %hash,
                height,
                from = latest_height,
                "Better fork block, rolling back"
            );
            let mut removed = Vec::new();
            for _ in 0..(latest_height - height + 1) {
                let Some((head, _)) = self.chain.latest()? else {
                    break;
                };
                self.utxo.rollback(&head, &self.chain)?;
                self.chain.rollback()?;
                removed.push(head);
            }
            self.commit(&block, true).await?;
            self.restore_transactions(&removed, &block).await;
            return Ok(());
        }

        if height == latest_height + 1 {
            if prev_hash == latest_hash {
                self.commit(&block, false).await?;
            } else {
                self.requeue_or_drop(block);
            }
            return Ok(());
        }

        // Gap of more than one block: wait for the predecessor if it is in
        // flight, otherwise the submitter was already told to pull it.
        let prev_pending = {
            let mut seen = self.shared.seen.lock();
            seen.get(&prev_hash).map(|e| !e.processed).unwrap_or(false)
        };
        if prev_pending {
            self.requeue_or_drop(block);
        } else {
            debug!(%hash, height, "Predecessor not pending, dropping future block");
        }
        Ok(())
    }

    /// Persist and run the per-round refresh sequence.
    async fn commit(&self, block: &Block, rolled_back: bool) -> Result<(), StoreError> {
        self.chain.insert_block(block)?;
        self.utxo.apply(block)?;

        let height = block.height();
        self.votes.refresh(height, rolled_back);
        self.timer.refresh(height, rolled_back);
        self.selector.refresh(height);
        if let Some(params) = block.delay_params() {
            self.calculator.update(&params.seed, params.proof.as_deref());
        }
        self.mempool.set_height(height as i64, rolled_back);
        for tx in &block.transactions {
            self.mempool.remove(&tx.tx_hash);
        }
        info!(height, hash = %block.hash(), rolled_back, "Block committed");
        Ok(())
    }

    /// Return transactions from rolled-back blocks to the mempool, minus
    /// those the winning block already carries.
    async fn restore_transactions(&self, removed: &[Block], winner: &Block) {
        let kept: std::collections::HashSet<&str> = winner
            .transactions
            .iter()
            .map(|tx| tx.tx_hash.as_str())
            .collect();
        for block in removed {
            for tx in &block.transactions {
                if tx.is_coinbase() || kept.contains(tx.tx_hash.as_str()) {
                    continue;
                }
                if self.mempool.add(tx.clone()).await {
                    debug!(tx = %tx.tx_hash, "Restored rolled-back transaction");
                }
            }
        }
    }

    fn requeue_or_drop(&self, block: Block) {
        let hash = block.hash().to_string();
        let mut seen = self.shared.seen.lock();
        let Some(entry) = seen.get_mut(&hash) else {
            return;
        };
        if entry.requeues >= MAX_REQUEUES {
            warn!(%hash, "Requeue limit reached, dropping block");
            return;
        }
        entry.requeues += 1;
        entry.processed = false;
        drop(seen);

        debug!(%hash, "Requeueing block pending its ancestor");
        if self.requeue_tx.try_send(block).is_err() {
            warn!(%hash, "Merge queue full, dropping requeued block");
        }
    }
}

/// Breaks the selector/merge construction cycle: the selector is built
/// first with an empty slot, the engine fills it.
#[derive(Clone, Default)]
pub struct MergeHandleSlot {
    slot: Arc<Mutex<Option<MergeHandle>>>,
}

impl MergeHandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn fill(&self, handle: MergeHandle) {
        *self.slot.lock() = Some(handle);
    }

    pub fn get(&self) -> Option<MergeHandle> {
        self.slot.lock().clone()
    }
}
