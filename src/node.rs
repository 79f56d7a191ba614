//! Round driver: the consensus tick.
//!
//! Once the round deadline passes the node casts its memoized vote; once
//! the grace deadline passes it packages a candidate when it won the vote
//! (or when no votes arrived and it is eligible), and lets the selector
//! commit the round winner.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainStore, Packager};
use crate::mempool::Mempool;
use crate::network::manager::Manager;
use crate::round::RoundTimer;
use crate::selector::BlockSelector;
use crate::vdf::Calculator;
use crate::vote::VoteCenter;

const TICK: Duration = Duration::from_millis(500);

pub struct RoundDriver {
    chain: Arc<ChainStore>,
    mempool: Arc<Mempool>,
    votes: Arc<VoteCenter>,
    timer: Arc<RoundTimer>,
    calculator: Arc<Calculator>,
    selector: Arc<BlockSelector>,
    manager: Arc<Manager>,
    packager: Packager,
}

impl RoundDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<ChainStore>,
        mempool: Arc<Mempool>,
        votes: Arc<VoteCenter>,
        timer: Arc<RoundTimer>,
        calculator: Arc<Calculator>,
        selector: Arc<BlockSelector>,
        manager: Arc<Manager>,
        packager: Packager,
    ) -> Self {
        Self {
            chain,
            mempool,
            votes,
            timer,
            calculator,
            selector,
            manager,
            packager,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            self.step().await;
        }
    }

    /// One consensus tick. Public so tests can drive rounds directly.
    pub async fn step(&self) {
        if !self.calculator.is_initialized() {
            return;
        }
        let next = self.timer.next_height();
        if next == 0 || !self.timer.reach() {
            return;
        }

        if !self.votes.has_voted() {
            match self.votes.local_vote(next) {
                Some(target) => debug!(%target, round = next, "Voted for round"),
                None => debug!(round = next, "No vote cast this round"),
            }
        }

        if !self.timer.finish() {
            return;
        }

        if self.local_wins() {
            self.package_round(next).await;
        }
        // Grace expired: commit the best candidate seen so far.
        self.selector.commit();
    }

    /// Local node packages when it won the vote, or — with an empty vote
    /// table, as on a freshly bootstrapped network — when it is eligible.
    fn local_wins(&self) -> bool {
        match self.votes.winner() {
            Some(winner) => winner == self.packager.address,
            None => self.calculator.is_consensus_node(&self.packager.address),
        }
    }

    async fn package_round(&self, height: u64) {
        let Some(transactions) = self.mempool.package(height).await else {
            return;
        };
        let Some(delay_params) = self.calculator.delay_params() else {
            warn!("VDF parameters unavailable, skipping packaging");
            return;
        };
        let vote_info = self.votes.snapshot();

        match self
            .chain
            .package_new_block(transactions, vote_info, delay_params, &self.packager)
        {
            Ok(Some(block)) => {
                info!(
                    height,
                    hash = %block.hash(),
                    txs = block.transactions.len(),
                    "Packaged candidate block"
                );
                self.calculator.update_local();
                self.manager.accept_block(block);
            }
            Ok(None) => warn!(height, "Packaging produced no block"),
            Err(e) => warn!(error = %e, height, "Packaging failed"),
        }
    }
}
