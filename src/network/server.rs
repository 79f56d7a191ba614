//! TCP listener and outbound connector for peer sessions.
//!
//! Peer discovery proper lives outside the core; the configured bootstrap
//! list stands in for the overlay's `nodes()` view and the connector
//! redials dropped peers on a fixed cadence.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::network::session::{PeerSession, SessionContext};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

pub struct PeerServer {
    listen_address: String,
    bootstrap_peers: Vec<String>,
    ctx: Arc<SessionContext>,
}

impl PeerServer {
    pub fn new(
        listen_address: String,
        bootstrap_peers: Vec<String>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        Self {
            listen_address,
            bootstrap_peers,
            ctx,
        }
    }

    /// Accept inbound sessions until shutdown.
    pub async fn run_listener(self: Arc<Self>, shutdown: CancellationToken) {
        let listener = match TcpListener::bind(&self.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!(address = %self.listen_address, error = %e, "Failed to bind peer listener");
                return;
            }
        };
        info!(address = %self.listen_address, "Peer listener started");

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Inbound peer connection");
                    PeerSession::spawn(stream, self.ctx.clone(), shutdown.clone());
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    }

    /// Redial configured peers we have no session with.
    pub async fn run_connector(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(RECONNECT_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = shutdown.cancelled() => return,
            }
            for peer in &self.bootstrap_peers {
                if peer == &self.listen_address || self.ctx.manager.has_session(peer) {
                    continue;
                }
                match TcpStream::connect(peer).await {
                    Ok(stream) => {
                        info!(%peer, "Connected to bootstrap peer");
                        PeerSession::spawn(stream, self.ctx.clone(), shutdown.clone());
                    }
                    Err(e) => debug!(%peer, error = %e, "Dial failed"),
                }
            }
        }
    }
}
