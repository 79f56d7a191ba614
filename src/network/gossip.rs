//! UDP gossip bus for transactions.
//!
//! One JSON-encoded transaction per datagram, 64 KiB ceiling. The server
//! validates shape before admission; the client re-broadcasts admitted
//! transactions to a uniformly random half of the known neighbors. The
//! mempool's primary map suppresses duplicates.

use rand::seq::SliceRandom;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mempool::Mempool;
use crate::network::manager::Manager;
use crate::types::Transaction;

/// Maximum datagram size accepted or sent.
pub const MAX_DATAGRAM: usize = 64 * 1024;
const REBROADCAST_QUEUE_DEPTH: usize = 256;

pub struct GossipBus {
    listen_address: String,
    gossip_port: u16,
    mempool: Arc<Mempool>,
    manager: Arc<Manager>,
    queue_tx: mpsc::Sender<Transaction>,
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<Transaction>>>,
}

impl GossipBus {
    pub fn new(
        listen_address: String,
        gossip_port: u16,
        mempool: Arc<Mempool>,
        manager: Arc<Manager>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(REBROADCAST_QUEUE_DEPTH);
        Self {
            listen_address,
            gossip_port,
            mempool,
            manager,
            queue_tx,
            queue_rx: parking_lot::Mutex::new(Some(queue_rx)),
        }
    }

    /// Admit a locally submitted transaction and queue it for gossip.
    pub async fn submit(&self, tx: Transaction) -> bool {
        if !self.mempool.add(tx.clone()).await {
            return false;
        }
        if self.queue_tx.try_send(tx).is_err() {
            debug!("Gossip queue full, dropping re-broadcast");
        }
        true
    }

    /// Datagram server: decode, validate, admit, queue for re-broadcast.
    pub async fn run_server(self: Arc<Self>, shutdown: CancellationToken) {
        let bind = format!("{}:{}", self.listen_address, self.gossip_port);
        let socket = match UdpSocket::bind(&bind).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(address = %bind, error = %e, "Failed to bind gossip socket");
                return;
            }
        };
        info!(address = %bind, "Gossip server started");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                received = socket.recv_from(&mut buf) => received,
                _ = shutdown.cancelled() => return,
            };
            let (len, from) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Gossip receive failed");
                    continue;
                }
            };

            let value: Value = match serde_json::from_slice(&buf[..len]) {
                Ok(value) => value,
                Err(e) => {
                    warn!(%from, error = %e, "Dropping undecodable datagram");
                    continue;
                }
            };
            if !validate_transaction_shape(&value) {
                warn!(%from, "Dropping schema-invalid transaction");
                continue;
            }
            let tx: Transaction = match serde_json::from_value(value) {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(%from, error = %e, "Dropping malformed transaction");
                    continue;
                }
            };

            debug!(%from, tx = %tx.tx_hash, "Gossip transaction received");
            self.submit(tx).await;
        }
    }

    /// Datagram client: forward each queued transaction to a random 50%
    /// sample of known neighbors.
    pub async fn run_client(self: Arc<Self>, shutdown: CancellationToken) {
        let Some(mut rx) = self.queue_rx.lock().take() else {
            warn!("Gossip client already running");
            return;
        };
        let socket = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "Failed to open gossip client socket");
                return;
            }
        };

        loop {
            let tx = tokio::select! {
                tx = rx.recv() => tx,
                _ = shutdown.cancelled() => return,
            };
            let Some(tx) = tx else { return };

            let payload = match serde_json::to_vec(&tx) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "Failed to encode transaction");
                    continue;
                }
            };
            if payload.len() > MAX_DATAGRAM {
                warn!(tx = %tx.tx_hash, "Transaction exceeds datagram limit, skipping");
                continue;
            }

            for target in self.sample_neighbors() {
                if let Err(e) = socket.send_to(&payload, &target).await {
                    debug!(%target, error = %e, "Gossip send failed");
                }
            }
        }
    }

    /// Half of the connected neighbors, uniformly sampled, rewritten to the
    /// gossip port.
    fn sample_neighbors(&self) -> Vec<String> {
        let peers = self.manager.session_peers();
        if peers.is_empty() {
            return Vec::new();
        }
        let sample_size = (peers.len() / 2).max(1);
        let mut rng = rand::thread_rng();
        peers
            .choose_multiple(&mut rng, sample_size)
            .filter_map(|peer| {
                let host = peer.rsplit_once(':').map(|(host, _)| host)?;
                Some(format!("{host}:{}", self.gossip_port))
            })
            .collect()
    }
}

/// Required shape before full decoding: `tx_hash`, `inputs[]`, `outputs[]`
/// with numeric values.
pub fn validate_transaction_shape(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let has_hash = obj
        .get("tx_hash")
        .and_then(Value::as_str)
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    let inputs_ok = obj.get("inputs").map(|v| v.is_array()).unwrap_or(false);
    let outputs_ok = obj
        .get("outputs")
        .and_then(Value::as_array)
        .map(|outputs| {
            outputs.iter().all(|o| {
                o.get("value").map(|v| v.is_u64()).unwrap_or(false)
                    && o.get("pub_key_hash").map(|v| v.is_string()).unwrap_or(false)
            })
        })
        .unwrap_or(false);
    has_hash && inputs_ok && outputs_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};

    #[test]
    fn shape_validation_accepts_real_transactions() {
        let tx = Transaction::new(
            vec![TxInput::new("aa".repeat(32), 0, "pk")],
            vec![TxOutput::new(10, "addr")],
        );
        let value = serde_json::to_value(&tx).unwrap();
        assert!(validate_transaction_shape(&value));
    }

    #[test]
    fn shape_validation_rejects_missing_fields() {
        assert!(!validate_transaction_shape(&serde_json::json!({})));
        assert!(!validate_transaction_shape(&serde_json::json!({
            "tx_hash": "", "inputs": [], "outputs": []
        })));
        assert!(!validate_transaction_shape(&serde_json::json!({
            "tx_hash": "ab", "inputs": [], "outputs": [{"value": "x", "pub_key_hash": "a"}]
        })));
        assert!(!validate_transaction_shape(&serde_json::json!([1, 2])));
    }
}
