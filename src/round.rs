//! Round timing anchored to the genesis timestamp.
//!
//! Round H's deadline is `genesis_ts + H * interval`; once it passes, the
//! block at height H+1 gets packaged, and selector candidates for that
//! height must be stamped within the package offset of the deadline. After
//! a further grace offset a stalled round lets the selector commit the
//! best candidate seen so far.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

use crate::chain::ChainStore;
use crate::types::now_ms;

pub struct RoundTimer {
    chain: Arc<ChainStore>,
    interval_ms: u64,
    finish_offset_ms: u64,
    /// Committed head height; the running round targets `height + 1`.
    height: Mutex<i64>,
}

impl RoundTimer {
    pub fn new(chain: Arc<ChainStore>, interval_ms: u64, finish_offset_ms: u64) -> Self {
        Self {
            chain,
            interval_ms,
            finish_offset_ms,
            height: Mutex::new(-1),
        }
    }

    fn genesis_ts(&self) -> Option<u64> {
        self.chain.genesis_timestamp().ok().flatten()
    }

    /// Absolute deadline of round `height`: when it passes, the block at
    /// `height + 1` is produced.
    pub fn deadline(&self, height: u64) -> Option<u64> {
        Some(self.genesis_ts()? + height * self.interval_ms)
    }

    pub fn next_height(&self) -> u64 {
        (*self.height.lock() + 1).max(0) as u64
    }

    fn current_deadline(&self) -> Option<u64> {
        let head = *self.height.lock();
        if head < 0 {
            return None;
        }
        self.deadline(head as u64)
    }

    /// True once the running round's deadline has passed.
    pub fn reach(&self) -> bool {
        match self.current_deadline() {
            Some(deadline) => now_ms() >= deadline,
            None => false,
        }
    }

    /// True once the grace period after the deadline has also passed.
    pub fn finish(&self) -> bool {
        match self.current_deadline() {
            Some(deadline) => now_ms() >= deadline + self.finish_offset_ms,
            None => false,
        }
    }

    pub fn refresh(&self, height: u64, rolled_back: bool) {
        let mut current = self.height.lock();
        if rolled_back || (height as i64) > *current {
            debug!(from = *current, to = height, "Round timer refreshed");
            *current = height as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::types::{merkle_root, Block, BlockHeader};
    use crate::kv::KvStore;
    use crate::types::{DelayParams, Transaction, VoteMap};

    fn chain_with_genesis(genesis_ts: u64) -> (tempfile::TempDir, Arc<ChainStore>) {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(KvStore::open(dir.path(), 8).unwrap());
        let chain = Arc::new(ChainStore::new(kv));
        let dp = DelayParams {
            order: Some("ff".into()),
            time_param: Some(10),
            seed: "0b".into(),
            proof: None,
            verify_param: Some("0d".into()),
        };
        let coinbase = Transaction::coinbase(VoteMap::new(), dp, "pk", 50, "addr", genesis_ts);
        let mut header =
            BlockHeader::new(merkle_root(&[coinbase.clone()]), 0, String::new(), genesis_ts);
        header.seal();
        chain
            .insert_block(&Block::new(header, vec![coinbase]))
            .unwrap();
        (dir, chain)
    }

    #[test]
    fn deadlines_are_genesis_anchored() {
        let genesis_ts = now_ms() - 100_000;
        let (_dir, chain) = chain_with_genesis(genesis_ts);
        let timer = RoundTimer::new(chain, 15_000, 10_000);
        timer.refresh(0, false);

        assert_eq!(timer.deadline(1).unwrap(), genesis_ts + 15_000);
        assert_eq!(timer.deadline(4).unwrap(), genesis_ts + 60_000);
        // Round 0 closed long ago; block 1 is due.
        assert_eq!(timer.next_height(), 1);
        assert!(timer.reach());
        assert!(timer.finish());
    }

    #[test]
    fn pending_round_not_reached() {
        let genesis_ts = now_ms() - 1_000;
        let (_dir, chain) = chain_with_genesis(genesis_ts);
        let timer = RoundTimer::new(chain, 3_600_000, 10_000);
        // Head at 2: round 2's deadline is hours away.
        timer.refresh(2, false);
        assert!(!timer.reach());
        assert!(!timer.finish());
    }

    #[test]
    fn no_rounds_before_genesis() {
        let genesis_ts = now_ms();
        let (_dir, chain) = chain_with_genesis(genesis_ts);
        let timer = RoundTimer::new(chain, 15_000, 10_000);
        // Height never refreshed: nothing committed yet.
        assert_eq!(timer.next_height(), 0);
        assert!(!timer.reach());
        assert!(!timer.finish());
    }

    #[test]
    fn finish_lags_reach_by_grace_offset() {
        // Round 0 deadline just passed; grace has not.
        let genesis_ts = now_ms() - 1_000;
        let (_dir, chain) = chain_with_genesis(genesis_ts);
        let timer = RoundTimer::new(chain, 500, 60_000);
        timer.refresh(0, false);
        assert!(timer.reach());
        assert!(!timer.finish());
    }

    #[test]
    fn refresh_monotonic_unless_rolled_back() {
        let genesis_ts = now_ms();
        let (_dir, chain) = chain_with_genesis(genesis_ts);
        let timer = RoundTimer::new(chain, 15_000, 10_000);
        timer.refresh(5, false);
        timer.refresh(3, false);
        assert_eq!(timer.next_height(), 6);
        timer.refresh(3, true);
        assert_eq!(timer.next_height(), 4);
    }
}
