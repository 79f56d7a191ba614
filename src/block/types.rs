//! Block and header types.
//!
//! The header hash commits to `(timestamp, prev_hash, merkle_root, height,
//! nonce)` as concatenated strings, SHA-256, hex — the same canonical-string
//! discipline used for transaction hashes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{DelayParams, Hash, Transaction, VoteMap};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Milliseconds since epoch; strictly greater than the predecessor's.
    pub timestamp: u64,
    pub prev_hash: Hash,
    pub hash: Hash,
    pub merkle_root: Hash,
    pub height: u64,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn new(merkle_root: Hash, height: u64, prev_hash: Hash, timestamp: u64) -> Self {
        Self {
            timestamp,
            prev_hash,
            hash: String::new(),
            merkle_root,
            height,
            nonce: 0,
        }
    }

    pub fn compute_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.timestamp.to_string().as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(self.merkle_root.as_bytes());
        hasher.update(self.height.to_string().as_bytes());
        hasher.update(self.nonce.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn seal(&mut self) {
        self.hash = self.compute_hash();
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// `transactions[0]` is the coinbase.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// VDF parameters recorded by the packager of this block.
    pub fn delay_params(&self) -> Option<&DelayParams> {
        self.coinbase()?.inputs[0].delay_params.as_ref()
    }

    pub fn vote_info(&self) -> Option<&VoteMap> {
        self.coinbase()?.inputs[0].vote_info.as_ref()
    }

    /// Total voters recorded in the coinbase vote aggregate. Drives the
    /// fork/candidate ordering.
    pub fn vote_count(&self) -> usize {
        self.vote_info()
            .map(|votes| votes.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Strict ordering used by both the selector and the merge engine:
    /// more votes win, then the earlier timestamp, then the smaller hash.
    pub fn beats(&self, other: &Block) -> bool {
        let lhs = (
            other.vote_count(),
            self.header.timestamp,
            self.header.hash.as_str(),
        );
        let rhs = (
            self.vote_count(),
            other.header.timestamp,
            other.header.hash.as_str(),
        );
        lhs < rhs
    }
}

/// Merkle root over the canonical JSON of each transaction. Odd levels
/// duplicate the trailing hash.
pub fn merkle_root(transactions: &[Transaction]) -> Hash {
    let mut hashes: Vec<[u8; 32]> = transactions
        .iter()
        .map(|tx| {
            let json = serde_json::to_string(tx).expect("tx serialization is infallible");
            Sha256::digest(json.as_bytes()).into()
        })
        .collect();

    if hashes.is_empty() {
        return hex::encode([0u8; 32]);
    }

    while hashes.len() > 1 {
        if hashes.len() % 2 == 1 {
            hashes.push(*hashes.last().expect("non-empty"));
        }
        hashes = hashes
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    hex::encode(hashes[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};

    fn tx(seed: u8) -> Transaction {
        Transaction::new(
            vec![TxInput::new(hex::encode([seed; 32]), 0, "pk")],
            vec![TxOutput::new(seed as u64 * 10, format!("addr-{seed}"))],
        )
    }

    fn block_with_votes(voters: usize, timestamp: u64, nonce: u64) -> Block {
        let mut votes = VoteMap::new();
        votes.insert(
            "target".into(),
            (0..voters).map(|i| format!("voter-{i}")).collect(),
        );
        let dp = DelayParams {
            order: None,
            time_param: None,
            seed: "0b".into(),
            proof: Some("01".into()),
            verify_param: None,
        };
        let coinbase = Transaction::coinbase(votes, dp, "pk", 50, "addr", timestamp);
        let mut header = BlockHeader::new(merkle_root(&[coinbase.clone()]), 3, "prev".into(), timestamp);
        header.nonce = nonce;
        header.seal();
        Block::new(header, vec![coinbase])
    }

    #[test]
    fn header_hash_is_deterministic() {
        let mut h = BlockHeader::new("root".into(), 5, "prev".into(), 1_700_000);
        h.seal();
        assert_eq!(h.hash, h.compute_hash());

        let mut other = h.clone();
        other.nonce += 1;
        assert_ne!(other.compute_hash(), h.hash);
    }

    #[test]
    fn merkle_root_changes_with_content() {
        let a = merkle_root(&[tx(1), tx(2), tx(3)]);
        let b = merkle_root(&[tx(1), tx(2), tx(4)]);
        assert_ne!(a, b);
        // single tx root equals that tx's leaf hash
        let single = merkle_root(&[tx(7)]);
        let json = serde_json::to_string(&tx(7)).unwrap();
        assert_eq!(single, hex::encode(Sha256::digest(json.as_bytes())));
    }

    #[test]
    fn merkle_root_of_empty_set_is_zero() {
        assert_eq!(merkle_root(&[]), hex::encode([0u8; 32]));
    }

    #[test]
    fn ordering_votes_then_time_then_hash() {
        let few = block_with_votes(1, 100, 0);
        let many = block_with_votes(3, 200, 0);
        assert!(many.beats(&few));
        assert!(!few.beats(&many));

        let early = block_with_votes(2, 100, 0);
        let late = block_with_votes(2, 200, 0);
        assert!(early.beats(&late));

        let a = block_with_votes(2, 100, 1);
        let b = block_with_votes(2, 100, 2);
        let (small, big) = if a.header.hash < b.header.hash {
            (a, b)
        } else {
            (b, a)
        };
        assert!(small.beats(&big));
        assert!(!big.beats(&small));
        // irreflexive
        assert!(!small.beats(&small.clone()));
    }

    #[test]
    fn vote_count_sums_all_targets() {
        let mut votes = VoteMap::new();
        votes.insert("a".into(), vec!["v1".into(), "v2".into()]);
        votes.insert("b".into(), vec!["v3".into()]);
        let dp = DelayParams {
            order: None,
            time_param: None,
            seed: "0b".into(),
            proof: None,
            verify_param: None,
        };
        let coinbase = Transaction::coinbase(votes, dp, "pk", 50, "addr", 1);
        let mut header = BlockHeader::new(merkle_root(&[coinbase.clone()]), 1, "p".into(), 1);
        header.seal();
        let block = Block::new(header, vec![coinbase]);
        assert_eq!(block.vote_count(), 3);
    }
}
