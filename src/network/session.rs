//! Per-neighbor peer session: one inbound handler and one outbound sender
//! over a framed TCP stream.
//!
//! The outbound side also drives the handshake cadence. Any framing,
//! decode or write error tears the session down; the connect loop will
//! re-establish it on a later tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::ChainStore;
use crate::merge::{MergeHandle, SubmitStatus};
use crate::network::manager::{AcceptOutcome, Manager};
use crate::network::message::{HandshakePayload, PeerMessage};
use crate::network::wire::{read_frame, write_frame};
use crate::types::now_ms;
use crate::vote::VoteCenter;

const OUTBOUND_QUEUE_DEPTH: usize = 64;
/// Upper bound on blocks pulled per handshake round.
const MAX_PULL_BATCH: u64 = 512;

/// Dependencies shared by every session.
pub struct SessionContext {
    pub chain: Arc<ChainStore>,
    pub merge: MergeHandle,
    pub manager: Arc<Manager>,
    pub votes: Arc<VoteCenter>,
    pub local_address: String,
    pub handshake_interval: Duration,
}

pub struct PeerSession {
    peer: String,
    outbound: mpsc::Sender<PeerMessage>,
    ctx: Arc<SessionContext>,
}

impl PeerSession {
    /// Split the stream and run the reader and writer halves until either
    /// fails or the node shuts down.
    pub fn spawn(stream: TcpStream, ctx: Arc<SessionContext>, shutdown: CancellationToken) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        ctx.manager.register(&peer, outbound_tx.clone());
        info!(%peer, "Peer session established");

        let session = Arc::new(Self {
            peer: peer.clone(),
            outbound: outbound_tx,
            ctx,
        });

        let writer = session.clone();
        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            writer.write_loop(write_half, outbound_rx, writer_shutdown).await;
        });

        let reader = session;
        tokio::spawn(async move {
            reader.read_loop(read_half, shutdown).await;
            reader.ctx.manager.unregister(&reader.peer);
            info!(peer = %reader.peer, "Peer session closed");
        });
    }

    async fn write_loop(
        &self,
        mut write_half: OwnedWriteHalf,
        mut outbound_rx: mpsc::Receiver<PeerMessage>,
        shutdown: CancellationToken,
    ) {
        let mut heartbeat = tokio::time::interval(self.ctx.handshake_interval);
        loop {
            let message = tokio::select! {
                message = outbound_rx.recv() => match message {
                    Some(message) => message,
                    None => return,
                },
                _ = heartbeat.tick() => self.handshake(),
                _ = shutdown.cancelled() => return,
            };

            let frame = match message.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                debug!(peer = %self.peer, error = %e, "Write failed, closing session");
                return;
            }
        }
    }

    async fn read_loop(&self, mut read_half: OwnedReadHalf, shutdown: CancellationToken) {
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut read_half) => frame,
                _ = shutdown.cancelled() => return,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(peer = %self.peer, "Peer closed connection");
                    return;
                }
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Framing error, closing session");
                    return;
                }
            };
            let message = match PeerMessage::from_frame(frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "Undecodable message, closing session");
                    return;
                }
            };
            self.handle(message).await;
        }
    }

    fn handshake(&self) -> PeerMessage {
        let height = self
            .ctx
            .chain
            .latest_height()
            .ok()
            .flatten()
            .map(|h| h as i64)
            .unwrap_or(-1);
        PeerMessage::Handshake(HandshakePayload {
            height,
            address: self.ctx.local_address.clone(),
            timestamp: now_ms(),
            votes: self.ctx.votes.snapshot(),
        })
    }

    async fn send(&self, message: PeerMessage) {
        if self.outbound.send(message).await.is_err() {
            debug!(peer = %self.peer, "Outbound channel closed");
        }
    }

    async fn handle(&self, message: PeerMessage) {
        match message {
            PeerMessage::Empty | PeerMessage::BlockKnown => {}

            PeerMessage::Handshake(payload) => {
                self.ctx
                    .votes
                    .record_heartbeat(&payload.address, payload.timestamp);

                let local_height = self
                    .ctx
                    .chain
                    .latest_height()
                    .ok()
                    .flatten()
                    .map(|h| h as i64)
                    .unwrap_or(-1);
                self.ctx
                    .votes
                    .sync(&payload.votes, (local_height + 1).max(0) as u64);

                if payload.height > local_height {
                    let from = (local_height + 1).max(0) as u64;
                    let to = (payload.height as u64).min(from + MAX_PULL_BATCH - 1);
                    debug!(peer = %self.peer, from, to, "Behind peer, pulling blocks");
                    for height in from..=to {
                        self.send(PeerMessage::PullBlock(height)).await;
                    }
                }
            }

            PeerMessage::PullBlock(height) => {
                match self.ctx.chain.block_by_height(height) {
                    Ok(Some(block)) => self.send(PeerMessage::PushBlock(block)).await,
                    Ok(None) => self.send(PeerMessage::Empty).await,
                    Err(e) => warn!(error = %e, height, "Block lookup failed"),
                }
            }

            PeerMessage::PushBlock(block) => {
                let prev_hash = block.header.prev_hash.clone();
                if self.ctx.merge.submit(block) == SubmitStatus::PullPredecessor {
                    self.send(PeerMessage::GetBlock(prev_hash)).await;
                }
            }

            PeerMessage::NewBlock(block) => {
                match self.ctx.manager.accept_block(block) {
                    AcceptOutcome::Known => {}
                    AcceptOutcome::Routed { pull } => {
                        if let Some(prev_hash) = pull {
                            self.send(PeerMessage::GetBlock(prev_hash)).await;
                        }
                    }
                }
            }

            PeerMessage::NewBlockHash(hash) => {
                let known = self
                    .ctx
                    .chain
                    .block_by_hash(&hash)
                    .map(|b| b.is_some())
                    .unwrap_or(false)
                    || self.ctx.manager.known_block(&hash).is_some();
                if known {
                    self.send(PeerMessage::BlockKnown).await;
                } else {
                    self.send(PeerMessage::GetBlock(hash)).await;
                }
            }

            PeerMessage::GetBlock(hash) => {
                let block = match self.ctx.chain.block_by_hash(&hash) {
                    Ok(block) => block.or_else(|| self.ctx.manager.known_block(&hash)),
                    Err(e) => {
                        warn!(error = %e, "Block lookup failed");
                        None
                    }
                };
                match block {
                    Some(block) => self.send(PeerMessage::NewBlock(block)).await,
                    None => self.send(PeerMessage::Empty).await,
                }
            }
        }
    }
}
