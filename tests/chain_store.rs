//! Chain store integration: genesis bootstrap, lookups, rollback and
//! block verification against real signatures.

use std::sync::Arc;

use tempo::block::genesis;
use tempo::block::types::{merkle_root, Block, BlockHeader};
use tempo::chain::{ChainStore, Packager};
use tempo::keys;
use tempo::kv::KvStore;
use tempo::types::{DelayParams, Transaction, TxInput, TxOutput, VoteMap};
use tempo::utxo::UtxoSet;

struct Harness {
    _dir: tempfile::TempDir,
    chain: Arc<ChainStore>,
    utxo: Arc<UtxoSet>,
    key: ed25519_dalek::SigningKey,
    address: String,
    packager: Packager,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let kv = Arc::new(KvStore::open(dir.path(), 16).unwrap());
    let chain = Arc::new(ChainStore::new(kv.clone()));
    let utxo = Arc::new(UtxoSet::new(kv));
    let key = keys::generate();
    let address = keys::address_from_pubkey(&key.verifying_key());
    let packager = Packager {
        address: address.clone(),
        pub_key: keys::pub_key_hex(&key),
        reward: 5_000,
    };
    Harness {
        _dir: dir,
        chain,
        utxo,
        key,
        address,
        packager,
    }
}

fn genesis_delay_params() -> DelayParams {
    DelayParams {
        order: Some("c9".into()),
        time_param: Some(10_000_000),
        seed: "11".into(),
        proof: None,
        verify_param: Some("0d".into()),
    }
}

fn insert_genesis(h: &Harness) -> Block {
    let block = genesis::from_delay_params(&h.packager, genesis_delay_params(), 1_700_000_000_000);
    h.chain.insert_block(&block).unwrap();
    h.utxo.apply(&block).unwrap();
    block
}

fn next_block(h: &Harness, prev: &Block, txs: Vec<Transaction>, seed: &str) -> Block {
    let dp = DelayParams {
        order: None,
        time_param: None,
        seed: seed.into(),
        proof: Some("01".into()),
        verify_param: None,
    };
    let ts = prev.header.timestamp + 15_000;
    let coinbase = Transaction::coinbase(VoteMap::new(), dp, &h.packager.pub_key, 5_000, &h.address, ts);
    let mut all = vec![coinbase];
    all.extend(txs);
    let mut header = BlockHeader::new(
        merkle_root(&all),
        prev.height() + 1,
        prev.header.hash.clone(),
        ts,
    );
    header.seal();
    Block::new(header, all)
}

/// Signed spend of the coinbase output of `source`.
fn spend_coinbase(h: &Harness, source: &Block, to: &str, value: u64) -> Transaction {
    let coinbase = &source.transactions[0];
    let mut tx = Transaction::new(
        vec![TxInput::new(
            coinbase.tx_hash.clone(),
            0,
            keys::pub_key_hex(&h.key),
        )],
        vec![TxOutput::new(value, to)],
    );
    tx.sign_input(0, &h.address, &h.key);
    tx
}

#[test]
fn genesis_bootstrap() {
    let h = harness();
    assert!(h.chain.latest().unwrap().is_none());

    let genesis = insert_genesis(&h);

    let (head, head_hash) = h.chain.latest().unwrap().unwrap();
    assert_eq!(head.header.hash, genesis.header.hash);
    assert_eq!(head_hash, genesis.header.hash);
    assert_eq!(
        h.chain.block_by_height(0).unwrap().unwrap().header.hash,
        genesis.header.hash
    );
    assert_eq!(h.utxo.latest_height().unwrap(), Some(0));

    // Genesis delay params are served back for the calculator.
    let params = h.chain.latest_delay_params().unwrap().unwrap();
    assert_eq!(params.time_param, Some(10_000_000));
    assert_eq!(
        h.chain.genesis_timestamp().unwrap(),
        Some(1_700_000_000_000)
    );
}

#[test]
fn lookups_roundtrip_through_caches() {
    let h = harness();
    let genesis = insert_genesis(&h);
    let b1 = next_block(&h, &genesis, vec![], "22");
    h.chain.insert_block(&b1).unwrap();

    // Repeated lookups hit the caches; results stay identical.
    for _ in 0..3 {
        assert_eq!(
            h.chain.block_by_hash(&b1.header.hash).unwrap().unwrap().height(),
            1
        );
        assert_eq!(
            h.chain.block_by_height(1).unwrap().unwrap().header.hash,
            b1.header.hash
        );
    }
    let coinbase_hash = &b1.transactions[0].tx_hash;
    assert_eq!(
        h.chain
            .transaction_by_hash(coinbase_hash)
            .unwrap()
            .unwrap()
            .tx_hash,
        *coinbase_hash
    );
    assert!(h.chain.block_by_height(7).unwrap().is_none());
    assert!(h.chain.block_by_hash("missing").unwrap().is_none());
}

#[test]
fn rollback_repoints_head_and_drops_records() {
    let h = harness();
    let genesis = insert_genesis(&h);
    let b1 = next_block(&h, &genesis, vec![], "22");
    h.chain.insert_block(&b1).unwrap();

    let removed = h.chain.rollback().unwrap().unwrap();
    assert_eq!(removed.header.hash, b1.header.hash);

    let (head, _) = h.chain.latest().unwrap().unwrap();
    assert_eq!(head.height(), 0);
    assert!(h.chain.block_by_height(1).unwrap().is_none());
    assert!(h.chain.block_by_hash(&b1.header.hash).unwrap().is_none());
    assert!(h
        .chain
        .transaction_by_hash(&b1.transactions[0].tx_hash)
        .unwrap()
        .is_none());

    // Genesis survives untouched.
    assert_eq!(
        h.chain.block_by_height(0).unwrap().unwrap().header.hash,
        genesis.header.hash
    );
}

#[test]
fn rollback_of_genesis_empties_the_chain() {
    let h = harness();
    insert_genesis(&h);
    h.chain.rollback().unwrap().unwrap();
    assert!(h.chain.latest().unwrap().is_none());
    assert!(h.chain.rollback().unwrap().is_none());
}

#[test]
fn verify_block_checks_signatures() {
    let h = harness();
    let genesis = insert_genesis(&h);

    let spend = spend_coinbase(&h, &genesis, "dest-addr", 4_000);
    let good = next_block(&h, &genesis, vec![spend.clone()], "22");
    assert!(h.chain.verify_block(&good).unwrap());

    // Tampered signature fails.
    let mut tampered = spend.clone();
    tampered.inputs[0].signature = Some("00".repeat(64));
    let bad = next_block(&h, &genesis, vec![tampered], "23");
    assert!(!h.chain.verify_block(&bad).unwrap());

    // Unknown previous transaction fails, without erroring.
    let mut orphan = Transaction::new(
        vec![TxInput::new("ab".repeat(32), 0, keys::pub_key_hex(&h.key))],
        vec![TxOutput::new(1, "dest")],
    );
    orphan.sign_input(0, &h.address, &h.key);
    let orphan_block = next_block(&h, &genesis, vec![orphan], "24");
    assert!(!h.chain.verify_block(&orphan_block).unwrap());
}

#[test]
fn verify_rejects_wrong_owner_substitution() {
    let h = harness();
    let genesis = insert_genesis(&h);

    // Signed over the wrong owner address: digest mismatch.
    let coinbase = &genesis.transactions[0];
    let mut tx = Transaction::new(
        vec![TxInput::new(
            coinbase.tx_hash.clone(),
            0,
            keys::pub_key_hex(&h.key),
        )],
        vec![TxOutput::new(10, "dest")],
    );
    tx.sign_input(0, "not-the-owner", &h.key);
    assert!(!h.chain.verify_transaction(&tx).unwrap());
}

#[test]
fn package_builds_verified_block() {
    let h = harness();
    let genesis = insert_genesis(&h);
    let spend = spend_coinbase(&h, &genesis, "dest-addr", 4_000);

    let dp = DelayParams {
        order: None,
        time_param: None,
        seed: "33".into(),
        proof: Some("02".into()),
        verify_param: None,
    };
    let block = h
        .chain
        .package_new_block(vec![spend.clone()], VoteMap::new(), dp, &h.packager)
        .unwrap()
        .unwrap();

    assert_eq!(block.height(), 1);
    assert_eq!(block.header.prev_hash, genesis.header.hash);
    assert!(block.transactions[0].is_coinbase());
    assert_eq!(block.transactions[1].tx_hash, spend.tx_hash);
    assert_eq!(block.header.merkle_root, merkle_root(&block.transactions));
    assert!(block.header.timestamp > genesis.header.timestamp);

    // A second spend of the same outpoint inside one package is dropped.
    let double = spend_coinbase(&h, &genesis, "other-addr", 3_000);
    let dp2 = DelayParams {
        order: None,
        time_param: None,
        seed: "34".into(),
        proof: Some("02".into()),
        verify_param: None,
    };
    let packed = h
        .chain
        .package_new_block(vec![spend, double], VoteMap::new(), dp2, &h.packager)
        .unwrap()
        .unwrap();
    assert_eq!(packed.transactions.len(), 2);
}
