//! Genesis block construction.
//!
//! The genesis coinbase anchors the whole system: it carries the VDF
//! modulus, iteration count, proving prime and the first seed, and its
//! timestamp anchors every round deadline.

use tracing::info;

use crate::block::types::{merkle_root, Block, BlockHeader};
use crate::chain::Packager;
use crate::types::{now_ms, DelayParams, Transaction, VoteMap};
use crate::vdf;

/// Tunables for fresh genesis parameters.
#[derive(Clone, Debug)]
pub struct GenesisSettings {
    /// Bit length of the VDF modulus N = p·q.
    pub modulus_bits: u64,
    /// Squaring iterations per round.
    pub time_param: u64,
}

/// Generate a bootstrap genesis block with freshly drawn VDF parameters.
pub fn build(packager: &Packager, settings: &GenesisSettings) -> Block {
    info!(
        modulus_bits = settings.modulus_bits,
        time_param = settings.time_param,
        "Generating genesis VDF parameters"
    );
    let (params, seed) = vdf::generate_params(settings.modulus_bits, settings.time_param);

    let delay_params = DelayParams {
        order: Some(vdf::int_to_hex(&params.order)),
        time_param: Some(params.time_param),
        seed: vdf::int_to_hex(&seed),
        proof: None,
        verify_param: Some(vdf::int_to_hex(&params.verify_param)),
    };
    from_delay_params(packager, delay_params, now_ms())
}

/// Assemble a genesis block from explicit delay parameters; used by the
/// builder above and by tests that need deterministic VDF settings.
pub fn from_delay_params(
    packager: &Packager,
    delay_params: DelayParams,
    timestamp: u64,
) -> Block {
    let coinbase = Transaction::coinbase(
        VoteMap::new(),
        delay_params,
        &packager.pub_key,
        packager.reward,
        &packager.address,
        timestamp,
    );
    let txs = vec![coinbase];
    let mut header = BlockHeader::new(merkle_root(&txs), 0, String::new(), timestamp);
    header.seal();
    Block::new(header, txs)
}
