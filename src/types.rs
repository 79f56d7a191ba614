//! Core transaction types for the Tempo ledger.
//!
//! Hashes are lowercase hex SHA-256 digests of canonical JSON preimages so
//! that every node derives identical identifiers from the wire encoding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::keys;

/// Hex-encoded SHA-256 digest.
pub type Hash = String;

/// Aggregated per-round votes: target address -> voter addresses.
pub type VoteMap = BTreeMap<String, Vec<String>>;

/// VDF parameters carried in a coinbase input.
///
/// The genesis coinbase fixes `order` (the modulus N), `time_param` (the
/// iteration count T) and `verify_param` (the proving prime); every later
/// coinbase carries only the round output `(seed, proof)`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayParams {
    #[serde(default)]
    pub order: Option<String>,
    #[serde(default)]
    pub time_param: Option<u64>,
    pub seed: String,
    #[serde(default)]
    pub proof: Option<String>,
    #[serde(default)]
    pub verify_param: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxInput {
    /// Hash of the transaction that produced the spent output. Empty for
    /// coinbase inputs.
    pub tx_hash: Hash,
    /// Output index within the producing transaction; -1 for coinbase.
    pub index: i64,
    pub signature: Option<String>,
    pub pub_key: Option<String>,
    /// Vote aggregate of the round, coinbase only.
    #[serde(default)]
    pub vote_info: Option<VoteMap>,
    /// VDF round parameters, coinbase only.
    #[serde(default)]
    pub delay_params: Option<DelayParams>,
}

impl TxInput {
    pub fn new(tx_hash: impl Into<String>, index: i64, pub_key: impl Into<String>) -> Self {
        Self {
            tx_hash: tx_hash.into(),
            index,
            signature: None,
            pub_key: Some(pub_key.into()),
            vote_info: None,
            delay_params: None,
        }
    }

    /// Canonical JSON used for hashing. `vote_info` and `delay_params` are
    /// excluded so a coinbase hashes like a plain input.
    fn canonical(&self) -> String {
        #[derive(Serialize)]
        struct Canonical<'a> {
            tx_hash: &'a str,
            index: i64,
            signature: &'a Option<String>,
            pub_key: &'a Option<String>,
        }
        serde_json::to_string(&Canonical {
            tx_hash: &self.tx_hash,
            index: self.index,
            signature: &self.signature,
            pub_key: &self.pub_key,
        })
        .expect("input serialization is infallible")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    /// Owning address (base58 with checksum).
    pub pub_key_hash: String,
}

impl TxOutput {
    pub fn new(value: u64, address: impl Into<String>) -> Self {
        Self {
            value,
            pub_key_hash: address.into(),
        }
    }

    fn canonical(&self) -> String {
        serde_json::to_string(self).expect("output serialization is infallible")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_hash: Hash,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        let mut tx = Self {
            tx_hash: String::new(),
            inputs,
            outputs,
        };
        tx.tx_hash = tx.compute_hash(None);
        tx
    }

    /// Build the coinbase for a round: no real input, the vote aggregate and
    /// VDF output ride the input, the reward goes to the packager.
    pub fn coinbase(
        vote_info: VoteMap,
        delay_params: DelayParams,
        pub_key: &str,
        reward: u64,
        reward_address: &str,
        timestamp_ms: u64,
    ) -> Self {
        let mut input = TxInput::new("", -1, pub_key);
        input.vote_info = Some(vote_info);
        input.delay_params = Some(delay_params);
        let mut tx = Self {
            tx_hash: String::new(),
            inputs: vec![input],
            outputs: vec![TxOutput::new(reward, reward_address)],
        };
        // The millisecond timestamp keeps coinbase hashes of the same node
        // distinct across rounds.
        tx.tx_hash = tx.compute_hash(Some(timestamp_ms));
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].tx_hash.is_empty() && self.inputs[0].index == -1
    }

    /// Canonical hash: stringified inputs, then outputs, then (coinbase
    /// only) the millisecond timestamp. SHA-256, hex.
    pub fn compute_hash(&self, coinbase_ts: Option<u64>) -> Hash {
        let mut hasher = Sha256::new();
        for input in &self.inputs {
            hasher.update(input.canonical().as_bytes());
        }
        for output in &self.outputs {
            hasher.update(output.canonical().as_bytes());
        }
        if let Some(ts) = coinbase_ts {
            hasher.update(ts.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Digest signed by the spender of input `idx`: the signature field is
    /// cleared and the referenced output's owner substituted for the public
    /// key before rehashing.
    pub fn signing_digest(&self, idx: usize, owner: &str) -> Hash {
        let mut copy = self.clone();
        copy.inputs[idx].signature = None;
        copy.inputs[idx].pub_key = Some(owner.to_string());
        copy.compute_hash(None)
    }

    /// Sign input `idx` with the key whose public half is already recorded
    /// on the input. `owner` is the address that owns the spent output.
    pub fn sign_input(&mut self, idx: usize, owner: &str, key: &ed25519_dalek::SigningKey) {
        let digest = self.signing_digest(idx, owner);
        self.inputs[idx].signature = Some(keys::sign(key, digest.as_bytes()));
    }

    pub fn output_sum(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// An unspent output as persisted in the UTXO index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub value: u64,
    pub owner: String,
    pub tx_hash: Hash,
    pub index: u32,
}

impl UtxoEntry {
    /// Primary index key, shared with the per-address secondary sets.
    pub fn key(&self) -> String {
        utxo_key(&self.tx_hash, self.index)
    }
}

pub fn utxo_key(tx_hash: &str, index: u32) -> String {
    format!("{}#{}", tx_hash, index)
}

/// Current wall clock in milliseconds.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        let mut tx = Transaction::new(
            vec![TxInput::new("aa".repeat(32), 0, "02abcd")],
            vec![TxOutput::new(90, "addr-one"), TxOutput::new(10, "addr-two")],
        );
        tx.inputs[0].signature = Some("00ff".into());
        tx.tx_hash = tx.compute_hash(None);
        tx
    }

    #[test]
    fn hash_survives_serde_roundtrip() {
        let tx = sample_tx();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tx_hash, tx.tx_hash);
        assert_eq!(back.compute_hash(None), tx.tx_hash);
    }

    #[test]
    fn coinbase_hash_folds_timestamp() {
        let dp = DelayParams {
            order: None,
            time_param: None,
            seed: "0b".into(),
            proof: Some("01".into()),
            verify_param: None,
        };
        let a = Transaction::coinbase(VoteMap::new(), dp.clone(), "pk", 50, "addr", 1_000);
        let b = Transaction::coinbase(VoteMap::new(), dp, "pk", 50, "addr", 1_001);
        assert_ne!(a.tx_hash, b.tx_hash);
        assert!(a.is_coinbase());
    }

    #[test]
    fn coinbase_metadata_excluded_from_preimage() {
        let dp = DelayParams {
            order: Some("ff".into()),
            time_param: Some(100),
            seed: "0b".into(),
            proof: None,
            verify_param: Some("03".into()),
        };
        let mut a = Transaction::coinbase(VoteMap::new(), dp.clone(), "pk", 50, "addr", 7);
        let mut with_votes = VoteMap::new();
        with_votes.insert("t".into(), vec!["v".into()]);
        let b = Transaction::coinbase(with_votes, dp, "pk", 50, "addr", 7);
        // vote_info differs but the canonical preimage ignores it
        assert_eq!(a.tx_hash, b.tx_hash);
        a.inputs[0].vote_info = None;
        assert_eq!(a.compute_hash(Some(7)), b.tx_hash);
    }

    #[test]
    fn signing_digest_ignores_existing_signature() {
        let tx = sample_tx();
        let mut unsigned = tx.clone();
        unsigned.inputs[0].signature = None;
        assert_eq!(
            tx.signing_digest(0, "owner-addr"),
            unsigned.signing_digest(0, "owner-addr")
        );
        assert_ne!(
            tx.signing_digest(0, "owner-a"),
            tx.signing_digest(0, "owner-b")
        );
    }

    #[test]
    fn sign_and_verify_input() {
        let key = keys::generate();
        let pub_hex = keys::pub_key_hex(&key);
        let owner = keys::address_from_pubkey(&key.verifying_key());

        let mut tx = Transaction::new(
            vec![TxInput::new("cc".repeat(32), 1, pub_hex.clone())],
            vec![TxOutput::new(5, "dest")],
        );
        tx.sign_input(0, &owner, &key);

        let digest = tx.signing_digest(0, &owner);
        assert!(keys::verify(
            &pub_hex,
            digest.as_bytes(),
            tx.inputs[0].signature.as_deref().unwrap()
        ));
        assert!(!keys::verify(
            &pub_hex,
            tx.signing_digest(0, "someone-else").as_bytes(),
            tx.inputs[0].signature.as_deref().unwrap()
        ));
    }
}
