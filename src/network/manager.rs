//! Session registry and block fan-out.
//!
//! Incoming blocks are deduplicated by hash, routed to the selector (round
//! candidates) or the merge engine (sync and fork blocks), and re-broadcast:
//! full blocks to sqrt(N) random neighbors, hash announces to the rest.

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::block::types::Block;
use crate::chain::ChainStore;
use crate::merge::{MergeHandleSlot, SubmitStatus};
use crate::network::message::PeerMessage;
use crate::selector::BlockSelector;

const KNOWN_BLOCKS: usize = 1024;
const BROADCAST_QUEUE_DEPTH: usize = 128;

/// What `accept_block` did with an incoming block.
#[derive(Debug)]
pub enum AcceptOutcome {
    /// Duplicate, nothing to do.
    Known,
    /// Routed; `pull` names a predecessor the submitter should fetch.
    Routed { pull: Option<String> },
}

pub struct Manager {
    sessions: DashMap<String, mpsc::Sender<PeerMessage>>,
    known: Mutex<LruCache<String, Block>>,
    broadcast_tx: mpsc::Sender<Block>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<Block>>>,
    selector: Arc<BlockSelector>,
    merge: MergeHandleSlot,
    chain: Arc<ChainStore>,
}

impl Manager {
    pub fn new(
        chain: Arc<ChainStore>,
        selector: Arc<BlockSelector>,
        merge: MergeHandleSlot,
    ) -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE_DEPTH);
        Self {
            sessions: DashMap::new(),
            known: Mutex::new(LruCache::new(
                NonZeroUsize::new(KNOWN_BLOCKS).expect("nonzero"),
            )),
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            selector,
            merge,
            chain,
        }
    }

    pub fn register(&self, peer: &str, sender: mpsc::Sender<PeerMessage>) {
        self.sessions.insert(peer.to_string(), sender);
    }

    pub fn unregister(&self, peer: &str) {
        self.sessions.remove(peer);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_peers(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    pub fn has_session(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }

    pub fn known_block(&self, hash: &str) -> Option<Block> {
        self.known.lock().get(hash).cloned()
    }

    pub fn is_known(&self, hash: &str) -> bool {
        self.known.lock().contains(hash)
    }

    /// Take in a block from a peer or the local packager: dedup, route and
    /// queue for re-broadcast.
    pub fn accept_block(&self, block: Block) -> AcceptOutcome {
        let hash = block.hash().to_string();
        {
            let mut known = self.known.lock();
            if known.contains(&hash) {
                return AcceptOutcome::Known;
            }
            known.put(hash.clone(), block.clone());
        }
        debug!(%hash, height = block.height(), "Manager accepted block");

        let pull = self.route(&block);

        if self.broadcast_tx.try_send(block).is_err() {
            warn!(%hash, "Broadcast queue full, dropping fan-out");
        }
        AcceptOutcome::Routed { pull }
    }

    /// Round candidates go to the selector; anything else goes straight to
    /// the merge engine.
    fn route(&self, block: &Block) -> Option<String> {
        let head = self
            .chain
            .latest_height()
            .ok()
            .flatten()
            .map(|h| h as i64)
            .unwrap_or(-1);

        if block.height() as i64 == head + 1 && head >= 0 {
            self.selector.compare(block);
            return None;
        }

        let Some(merge) = self.merge.get() else {
            warn!("Merge engine not wired, dropping block");
            return None;
        };
        match merge.submit(block.clone()) {
            SubmitStatus::PullPredecessor => Some(block.header.prev_hash.clone()),
            _ => None,
        }
    }

    /// Fan-out worker: full block to sqrt(N) random neighbors, compact hash
    /// announce to the remainder.
    pub async fn run_broadcast(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.broadcast_rx.lock().take() else {
            warn!("Broadcast worker already running");
            return;
        };
        loop {
            let block = tokio::select! {
                block = rx.recv() => block,
                _ = shutdown.cancelled() => return,
            };
            let Some(block) = block else { return };
            self.broadcast(block).await;
        }
    }

    async fn broadcast(&self, block: Block) {
        let peers = self.session_peers();
        if peers.is_empty() {
            return;
        }
        let full_count = (peers.len() as f64).sqrt().floor() as usize;
        let full_count = full_count.max(1);
        let full_peers: Vec<String> = {
            let mut rng = rand::thread_rng();
            peers
                .choose_multiple(&mut rng, full_count)
                .cloned()
                .collect()
        };

        let hash = block.hash().to_string();
        debug!(
            %hash,
            full = full_peers.len(),
            announce = peers.len() - full_peers.len(),
            "Broadcasting block"
        );
        for peer in &peers {
            let Some(sender) = self.sessions.get(peer).map(|e| e.value().clone()) else {
                continue;
            };
            let message = if full_peers.contains(peer) {
                PeerMessage::NewBlock(block.clone())
            } else {
                PeerMessage::NewBlockHash(hash.clone())
            };
            if sender.try_send(message).is_err() {
                debug!(%peer, "Outbound queue full, skipping peer");
            }
        }
    }
}
