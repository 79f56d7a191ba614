//! UTXO index integration: forward application, rollback inversion and
//! reindexing against the chain store.

use std::collections::BTreeMap;
use std::sync::Arc;

use tempo::block::genesis;
use tempo::block::types::{merkle_root, Block, BlockHeader};
use tempo::chain::{ChainStore, Packager};
use tempo::keys;
use tempo::kv::KvStore;
use tempo::types::{DelayParams, Transaction, TxInput, TxOutput, UtxoEntry, VoteMap};
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
        reward: 10_000,
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

fn delay_params(seed: &str) -> DelayParams {
    DelayParams {
        order: None,
        time_param: None,
        seed: seed.into(),
        proof: Some("01".into()),
        verify_param: None,
    }
}

fn genesis_block(h: &Harness) -> Block {
    let dp = DelayParams {
        order: Some("c9".into()),
        time_param: Some(100),
        seed: "11".into(),
        proof: None,
        verify_param: Some("0d".into()),
    };
    genesis::from_delay_params(&h.packager, dp, 1_700_000_000_000)
}

fn next_block(h: &Harness, prev: &Block, txs: Vec<Transaction>, seed: &str) -> Block {
    let ts = prev.header.timestamp + 15_000;
    let coinbase = Transaction::coinbase(
        VoteMap::new(),
        delay_params(seed),
        &h.packager.pub_key,
        h.packager.reward,
        &h.address,
        ts,
    );
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

fn spend(h: &Harness, source_tx: &Transaction, index: i64, outputs: Vec<(u64, &str)>) -> Transaction {
    let mut tx = Transaction::new(
        vec![TxInput::new(
            source_tx.tx_hash.clone(),
            index,
            keys::pub_key_hex(&h.key),
        )],
        outputs
            .into_iter()
            .map(|(value, addr)| TxOutput::new(value, addr))
            .collect(),
    );
    tx.sign_input(0, &h.address, &h.key);
    tx
}

fn state_of(h: &Harness, addresses: &[&str]) -> BTreeMap<String, BTreeMap<String, UtxoEntry>> {
    addresses
        .iter()
        .map(|a| (a.to_string(), h.utxo.find_by_address(a).unwrap()))
        .collect()
}

#[test]
fn apply_tracks_spends_and_outputs() {
    let h = harness();
    let genesis = genesis_block(&h);
    h.chain.insert_block(&genesis).unwrap();
    h.utxo.apply(&genesis).unwrap();

    let own = h.utxo.find_by_address(&h.address).unwrap();
    assert_eq!(own.len(), 1);
    assert_eq!(h.utxo.balance(&h.address).unwrap(), 10_000);

    // Spend the coinbase: 6_000 to a stranger, 4_000 back.
    let tx = spend(
        &h,
        &genesis.transactions[0],
        0,
        vec![(6_000, "stranger"), (4_000, &h.address)],
    );
    let b1 = next_block(&h, &genesis, vec![tx.clone()], "22");
    h.chain.insert_block(&b1).unwrap();
    h.utxo.apply(&b1).unwrap();

    assert_eq!(h.utxo.latest_height().unwrap(), Some(1));
    assert_eq!(h.utxo.balance("stranger").unwrap(), 6_000);
    // Coinbase of b1 (10_000) plus change (4_000); the genesis output is gone.
    assert_eq!(h.utxo.balance(&h.address).unwrap(), 14_000);
    let own = h.utxo.find_by_address(&h.address).unwrap();
    assert!(own
        .values()
        .all(|e| e.tx_hash != genesis.transactions[0].tx_hash));
}

#[test]
fn rollback_inverts_apply() {
    let h = harness();
    let genesis = genesis_block(&h);
    h.chain.insert_block(&genesis).unwrap();
    h.utxo.apply(&genesis).unwrap();

    let tx = spend(
        &h,
        &genesis.transactions[0],
        0,
        vec![(2_500, "alpha"), (7_500, "beta")],
    );
    let b1 = next_block(&h, &genesis, vec![tx], "22");
    h.chain.insert_block(&b1).unwrap();

    let watched = [h.address.as_str(), "alpha", "beta"];
    let before = state_of(&h, &watched);
    let height_before = h.utxo.latest_height().unwrap();

    h.utxo.apply(&b1).unwrap();
    h.utxo.rollback(&b1, &h.chain).unwrap();

    assert_eq!(state_of(&h, &watched), before);
    assert_eq!(h.utxo.latest_height().unwrap(), height_before);
}

#[test]
fn index_height_follows_chain_head() {
    let h = harness();
    let genesis = genesis_block(&h);
    h.chain.insert_block(&genesis).unwrap();
    h.utxo.apply(&genesis).unwrap();

    let b1 = next_block(&h, &genesis, vec![], "22");
    h.chain.insert_block(&b1).unwrap();
    h.utxo.apply(&b1).unwrap();
    let b2 = next_block(&h, &b1, vec![], "33");
    h.chain.insert_block(&b2).unwrap();
    h.utxo.apply(&b2).unwrap();

    assert_eq!(
        h.utxo.latest_height().unwrap().unwrap(),
        h.chain.latest_height().unwrap().unwrap()
    );

    h.utxo.rollback(&b2, &h.chain).unwrap();
    h.chain.rollback().unwrap();
    assert_eq!(
        h.utxo.latest_height().unwrap().unwrap(),
        h.chain.latest_height().unwrap().unwrap()
    );
}

#[test]
fn reindex_catches_up_missing_blocks() {
    let h = harness();
    let genesis = genesis_block(&h);
    h.chain.insert_block(&genesis).unwrap();
    h.utxo.apply(&genesis).unwrap();

    // Two blocks land without the index seeing them.
    let tx = spend(&h, &genesis.transactions[0], 0, vec![(10_000, "gamma")]);
    let b1 = next_block(&h, &genesis, vec![tx], "22");
    h.chain.insert_block(&b1).unwrap();
    let b2 = next_block(&h, &b1, vec![], "33");
    h.chain.insert_block(&b2).unwrap();

    h.utxo.reindex(&h.chain).unwrap();

    assert_eq!(h.utxo.latest_height().unwrap(), Some(2));
    assert_eq!(h.utxo.balance("gamma").unwrap(), 10_000);
    // Reindex twice is a no-op.
    h.utxo.reindex(&h.chain).unwrap();
    assert_eq!(h.utxo.balance("gamma").unwrap(), 10_000);
}

#[test]
fn full_rebuild_from_empty_index() {
    let h = harness();
    let genesis = genesis_block(&h);
    h.chain.insert_block(&genesis).unwrap();
    let b1 = next_block(&h, &genesis, vec![], "22");
    h.chain.insert_block(&b1).unwrap();

    // No `utxo latest` record yet; reindex replays from genesis.
    assert_eq!(h.utxo.latest_height().unwrap(), None);
    h.utxo.reindex(&h.chain).unwrap();
    assert_eq!(h.utxo.latest_height().unwrap(), Some(1));
    // Two coinbase rewards accumulated.
    assert_eq!(h.utxo.balance(&h.address).unwrap(), 20_000);
}
