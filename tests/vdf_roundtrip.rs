//! VDF round-trip: a computed `(result, proof)` verifies against its seed
//! and any perturbation falsifies it, with production-sized primes.

use num_bigint::BigUint;
use num_traits::One;

use tempo::vdf::{self, VdfParams};

fn params_with_primes(prime_bits: u64, time_param: u64) -> (VdfParams, BigUint) {
    // N = p * q, as the genesis builder draws them.
    let p = vdf::generate_prime(prime_bits);
    let q = vdf::generate_prime(prime_bits);
    let order = &p * &q;
    let verify_param = vdf::generate_prime(128);
    let seed = &order - BigUint::from(12_345u32);
    (
        VdfParams {
            order,
            time_param,
            verify_param,
        },
        seed,
    )
}

#[test]
fn computed_round_verifies() {
    let (params, seed) = params_with_primes(512, 50);
    let (result, proof) = vdf::compute_once(&params, seed.clone());
    assert!(vdf::verify_with_params(&params, &result, &proof, &seed));
}

#[test]
fn any_bit_flip_falsifies() {
    let (params, seed) = params_with_primes(512, 50);
    let (result, proof) = vdf::compute_once(&params, seed.clone());

    let flipped_result = &result ^ BigUint::one();
    assert!(!vdf::verify_with_params(
        &params,
        &flipped_result,
        &proof,
        &seed
    ));

    let flipped_proof = &proof ^ BigUint::one();
    assert!(!vdf::verify_with_params(
        &params,
        &result,
        &flipped_proof,
        &seed
    ));

    let perturbed_seed = &seed + BigUint::one();
    assert!(!vdf::verify_with_params(
        &params,
        &result,
        &proof,
        &perturbed_seed
    ));
}

#[test]
fn chained_rounds_feed_forward() {
    // The output seed of one round is the input of the next, as on chain.
    let (params, seed0) = params_with_primes(256, 25);
    let (seed1, proof1) = vdf::compute_once(&params, seed0.clone());
    let (seed2, proof2) = vdf::compute_once(&params, seed1.clone());

    assert!(vdf::verify_with_params(&params, &seed1, &proof1, &seed0));
    assert!(vdf::verify_with_params(&params, &seed2, &proof2, &seed1));
    // Cross-round mixing fails.
    assert!(!vdf::verify_with_params(&params, &seed2, &proof2, &seed0));
}

#[test]
fn hex_wire_format_roundtrips() {
    let (params, seed) = params_with_primes(256, 10);
    let (result, proof) = vdf::compute_once(&params, seed.clone());

    // As embedded in a coinbase and parsed back by a verifier.
    let seed_hex = vdf::int_to_hex(&seed);
    let result_hex = vdf::int_to_hex(&result);
    let proof_hex = vdf::int_to_hex(&proof);

    assert!(vdf::verify_with_params(
        &params,
        &vdf::hex_to_int(&result_hex).unwrap(),
        &vdf::hex_to_int(&proof_hex).unwrap(),
        &vdf::hex_to_int(&seed_hex).unwrap(),
    ));
}
