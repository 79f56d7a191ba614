//! Per-round aggregation of time-proximity votes.
//!
//! Producers push votes into a bounded queue; one drainer folds them into
//! the aggregate map after checking voter eligibility, so `update` never
//! blocks a peer session. The local vote picks, among eligible peers from
//! the heartbeat registry, the one whose last heartbeat lies closest to
//! local time.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::kv::{keyspace, KvStore};
use crate::types::{now_ms, VoteMap};
use crate::vdf::Calculator;

const VOTE_QUEUE_DEPTH: usize = 1024;
/// Heartbeats further than this from local time never win the vote.
const MAX_TIME_DELTA_MS: u64 = 1_000_000;

/// Entry in the persisted peer heartbeat registry (`wallets`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Last observed heartbeat, milliseconds since epoch.
    pub time: u64,
    pub id: u64,
}

pub type HeartbeatBook = BTreeMap<String, Heartbeat>;

#[derive(Debug)]
struct QueuedVote {
    voter: String,
    target: String,
}

struct VoteState {
    height: u64,
    votes: VoteMap,
    voters: HashSet<String>,
    has_voted: bool,
    final_target: Option<String>,
    rolled_back: bool,
}

pub struct VoteCenter {
    inner: Mutex<VoteState>,
    queue_tx: mpsc::Sender<QueuedVote>,
    queue_rx: Mutex<Option<mpsc::Receiver<QueuedVote>>>,
    calculator: Arc<Calculator>,
    kv: Arc<KvStore>,
    local_address: String,
    node_id: u64,
}

impl VoteCenter {
    pub fn new(
        calculator: Arc<Calculator>,
        kv: Arc<KvStore>,
        local_address: String,
        node_id: u64,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(VOTE_QUEUE_DEPTH);
        Self {
            inner: Mutex::new(VoteState {
                height: 0,
                votes: VoteMap::new(),
                voters: HashSet::new(),
                has_voted: false,
                final_target: None,
                rolled_back: false,
            }),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            calculator,
            kv,
            local_address,
            node_id,
        }
    }

    /// Enqueue one vote for the round at `height`. Stale heights and
    /// repeat voters are dropped here; eligibility is checked by the
    /// drainer.
    pub fn update(&self, voter: &str, target: &str, height: u64) {
        {
            let inner = self.inner.lock();
            if height < inner.height || inner.voters.contains(voter) {
                return;
            }
        }
        let queued = QueuedVote {
            voter: voter.to_string(),
            target: target.to_string(),
        };
        if self.queue_tx.try_send(queued).is_err() {
            debug!("Vote queue full, dropping vote");
        }
    }

    /// Bulk-merge a remote aggregate (rides peer handshakes).
    pub fn sync(&self, remote: &VoteMap, height: u64) {
        for (target, voters) in remote {
            for voter in voters {
                self.update(voter, target, height);
            }
        }
    }

    /// Drain the queue into the aggregate. Runs as the single consumer.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            warn!("Vote drainer already running");
            return;
        };
        loop {
            let vote = tokio::select! {
                vote = rx.recv() => vote,
                _ = shutdown.cancelled() => return,
            };
            let Some(vote) = vote else { return };
            self.apply_vote(vote.voter, vote.target);
        }
    }

    fn apply_vote(&self, voter: String, target: String) {
        if voter == target {
            return;
        }
        if !self.calculator.is_consensus_node(&voter) {
            debug!(%voter, "Dropping vote from ineligible address");
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.voters.insert(voter.clone()) {
            return;
        }
        debug!(%voter, %target, "Vote recorded");
        inner.votes.entry(target).or_default().push(voter);
    }

    /// Memoized local vote for the round at `height`: the eligible peer
    /// whose heartbeat is nearest to local time. The own vote is folded
    /// into the aggregate.
    pub fn local_vote(&self, height: u64) -> Option<String> {
        {
            let mut inner = self.inner.lock();
            if height < inner.height {
                return None;
            }
            if inner.has_voted {
                return inner.final_target.clone();
            }
            inner.has_voted = true;
        }

        let target = self.pick_nearest_peer();
        self.inner.lock().final_target = target.clone();
        if let Some(target) = &target {
            debug!(%target, height, "Local vote cast");
            self.update(&self.local_address, target, height);
        }
        target
    }

    fn pick_nearest_peer(&self) -> Option<String> {
        if !self.calculator.is_consensus_node(&self.local_address) {
            debug!("Local node not eligible this round");
            return None;
        }
        let book = self.heartbeats();
        let local_time = now_ms();
        let mut best: Option<(u64, String)> = None;
        for (address, heartbeat) in book {
            if address == self.local_address {
                continue;
            }
            if !self.calculator.is_consensus_node(&address) {
                continue;
            }
            let delta = local_time.abs_diff(heartbeat.time);
            if delta > MAX_TIME_DELTA_MS {
                continue;
            }
            if best.as_ref().map(|(d, _)| delta < *d).unwrap_or(true) {
                best = Some((delta, address));
            }
        }
        best.map(|(_, address)| address)
    }

    /// Winner of the current round: most votes, ties to the smaller
    /// address.
    pub fn winner(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner
            .votes
            .iter()
            .max_by(|(addr_a, votes_a), (addr_b, votes_b)| {
                votes_a
                    .len()
                    .cmp(&votes_b.len())
                    .then_with(|| addr_b.cmp(addr_a))
            })
            .map(|(address, _)| address.clone())
    }

    pub fn snapshot(&self) -> VoteMap {
        self.inner.lock().votes.clone()
    }

    pub fn has_voted(&self) -> bool {
        self.inner.lock().has_voted
    }

    pub fn height(&self) -> u64 {
        self.inner.lock().height
    }

    /// Clear the round on height advance; a rollback may lower the height.
    pub fn refresh(&self, height: u64, rolled_back: bool) -> bool {
        let mut inner = self.inner.lock();
        if !rolled_back && height <= inner.height {
            return false;
        }
        debug!(from = inner.height, to = height, rolled_back, "Vote center refreshed");
        inner.height = height;
        inner.votes.clear();
        inner.voters.clear();
        inner.has_voted = false;
        inner.final_target = None;
        inner.rolled_back = rolled_back;
        true
    }

    /// Record a peer heartbeat in the persisted registry.
    pub fn record_heartbeat(&self, address: &str, time_ms: u64) {
        let mut book = self.heartbeats();
        book.insert(
            address.to_string(),
            Heartbeat {
                time: time_ms,
                id: self.node_id,
            },
        );
        if let Err(e) = self.kv.put(keyspace::WALLETS, &book) {
            warn!(error = %e, "Failed to persist heartbeat registry");
        }
    }

    pub fn heartbeats(&self) -> HeartbeatBook {
        self.kv
            .get::<HeartbeatBook>(keyspace::WALLETS)
            .ok()
            .flatten()
            .unwrap_or_default()
    }
}
