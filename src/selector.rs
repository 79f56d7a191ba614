//! Candidate selection for the next height.
//!
//! One candidate survives per round. The first arrival wins only when it
//! was produced inside the round window; later arrivals replace it only
//! when they share the fork point and win the total order (votes desc,
//! timestamp asc, hash asc).

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::block::types::Block;
use crate::chain::ChainStore;
use crate::merge::MergeHandleSlot;

struct SelectorState {
    height: i64,
    candidate: Option<Block>,
    seen: HashSet<String>,
}

pub struct BlockSelector {
    chain: Arc<ChainStore>,
    merge: MergeHandleSlot,
    interval_ms: u64,
    package_offset_ms: u64,
    inner: Mutex<SelectorState>,
}

impl BlockSelector {
    pub fn new(
        chain: Arc<ChainStore>,
        merge: MergeHandleSlot,
        interval_ms: u64,
        package_offset_ms: u64,
    ) -> Self {
        Self {
            chain,
            merge,
            interval_ms,
            package_offset_ms,
            inner: Mutex::new(SelectorState {
                height: -1,
                candidate: None,
                seen: HashSet::new(),
            }),
        }
    }

    /// Offer a candidate for the running round. Blocks at other heights or
    /// already compared are ignored.
    pub fn compare(&self, block: &Block) {
        let hash = block.hash().to_string();
        let mut inner = self.inner.lock();
        if block.height() as i64 != inner.height + 1 || inner.seen.contains(&hash) {
            return;
        }
        inner.seen.insert(hash.clone());

        let Some(candidate) = &inner.candidate else {
            if self.is_past_window(block) {
                warn!(%hash, height = block.height(), "Candidate produced after round window");
                return;
            }
            debug!(%hash, height = block.height(), "First candidate of the round");
            inner.candidate = Some(block.clone());
            return;
        };

        if block.header.prev_hash != candidate.header.prev_hash || !block.beats(candidate) {
            debug!(%hash, current = %candidate.header.hash, "Candidate does not displace current");
            return;
        }
        info!(%hash, displaced = %candidate.header.hash, "Candidate replaced");
        inner.candidate = Some(block.clone());
    }

    /// A block packaged later than `(h - 1) * interval + genesis + offset`
    /// missed its round.
    fn is_past_window(&self, block: &Block) -> bool {
        if block.height() == 0 {
            return false;
        }
        let Ok(Some(genesis_ts)) = self.chain.genesis_timestamp() else {
            return false;
        };
        let cutoff = (block.height() - 1) * self.interval_ms + genesis_ts + self.package_offset_ms;
        block.header.timestamp > cutoff
    }

    /// Hand the round winner to the merge engine.
    pub fn commit(&self) {
        let candidate = self.inner.lock().candidate.take();
        let Some(block) = candidate else { return };
        info!(hash = %block.hash(), height = block.height(), "Committing round winner");
        match self.merge.get() {
            Some(merge) => {
                merge.submit(block);
            }
            None => warn!("Merge engine not wired, dropping round winner"),
        }
    }

    pub fn candidate_hash(&self) -> Option<String> {
        self.inner
            .lock()
            .candidate
            .as_ref()
            .map(|b| b.header.hash.clone())
    }

    pub fn height(&self) -> i64 {
        self.inner.lock().height
    }

    /// New round: forget candidates for the old height.
    pub fn refresh(&self, height: u64) {
        let mut inner = self.inner.lock();
        inner.height = height as i64;
        inner.candidate = None;
        inner.seen.clear();
    }
}
