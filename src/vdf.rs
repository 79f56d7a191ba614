//! Verifiable delay function: repeated squaring modulo N with a
//! Wesolowski-style proof, plus the address-eligibility oracle derived from
//! the current seed.
//!
//! One worker runs the squaring loop; `update` aborts and restarts it when
//! a committed block carries a different seed. All state sits behind one
//! mutex; the worker parks on a notifier while `finished` is set.

use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, ToPrimitive, Zero};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address;
use crate::chain::ChainStore;
use crate::types::DelayParams;

const MILLER_RABIN_ROUNDS: u32 = 40;

/// Fixed parameters from the genesis coinbase.
#[derive(Clone, Debug)]
pub struct VdfParams {
    /// Modulus N = p·q.
    pub order: BigUint,
    /// Iteration count T.
    pub time_param: u64,
    /// Proving prime l.
    pub verify_param: BigUint,
}

struct VdfState {
    seed: BigUint,
    proof: BigUint,
    result_seed: Option<BigUint>,
    result_proof: Option<BigUint>,
    finished: bool,
}

pub struct Calculator {
    params: Mutex<Option<VdfParams>>,
    state: Mutex<VdfState>,
    /// Set to abort the in-flight squaring loop.
    changed: Arc<AtomicBool>,
    notify: Notify,
    eligibility_threshold: f64,
}

impl Calculator {
    pub fn new(eligibility_threshold: f64) -> Self {
        Self {
            params: Mutex::new(None),
            state: Mutex::new(VdfState {
                seed: BigUint::zero(),
                proof: BigUint::one(),
                result_seed: None,
                result_proof: None,
                finished: false,
            }),
            changed: Arc::new(AtomicBool::new(false)),
            notify: Notify::new(),
            eligibility_threshold,
        }
    }

    /// Pull the fixed parameters from the genesis coinbase and the current
    /// round input from the head coinbase. Returns false until a genesis
    /// block exists.
    pub fn init_from_chain(&self, chain: &ChainStore) -> bool {
        if self.params.lock().is_some() {
            return true;
        }
        let genesis = match chain.block_by_height(0) {
            Ok(Some(block)) => block,
            Ok(None) => return false,
            Err(e) => {
                warn!(error = %e, "Failed to load genesis for VDF init");
                return false;
            }
        };
        let Some(genesis_params) = genesis.delay_params() else {
            warn!("Genesis coinbase carries no delay params");
            return false;
        };
        let (Some(order_hex), Some(time_param), Some(verify_hex)) = (
            genesis_params.order.as_deref(),
            genesis_params.time_param,
            genesis_params.verify_param.as_deref(),
        ) else {
            warn!("Genesis delay params incomplete");
            return false;
        };
        let (Some(order), Some(verify_param)) = (hex_to_int(order_hex), hex_to_int(verify_hex))
        else {
            warn!("Genesis delay params not parseable");
            return false;
        };

        let head_params = match chain.latest_delay_params() {
            Ok(Some(p)) => p,
            _ => genesis_params.clone(),
        };
        let seed = hex_to_int(&head_params.seed).unwrap_or_else(BigUint::zero);
        let proof = head_params
            .proof
            .as_deref()
            .and_then(hex_to_int)
            .unwrap_or_else(BigUint::one);

        *self.params.lock() = Some(VdfParams {
            order,
            time_param,
            verify_param,
        });
        let mut state = self.state.lock();
        state.seed = seed;
        state.proof = proof;
        state.finished = false;
        drop(state);
        info!(time_param, "VDF calculator initialized");
        self.notify.notify_waiters();
        true
    }

    /// Feed the seed and proof of a freshly committed block. A seed change
    /// aborts the running round and restarts from the new input.
    pub fn update(&self, seed_hex: &str, proof_hex: Option<&str>) {
        let Some(new_seed) = hex_to_int(seed_hex) else {
            warn!("Ignoring unparseable seed update");
            return;
        };
        let new_proof = proof_hex.and_then(hex_to_int).unwrap_or_else(BigUint::one);

        let mut state = self.state.lock();
        if state.seed == new_seed {
            return;
        }
        debug!("VDF seed changed, restarting round");
        state.seed = new_seed;
        state.proof = new_proof;
        state.result_seed = None;
        state.result_proof = None;
        if state.finished {
            state.finished = false;
            drop(state);
            self.notify.notify_waiters();
        } else {
            self.changed.store(true, Ordering::Relaxed);
        }
    }

    /// Promote the locally computed result to the next round's input (the
    /// local node packaged the block that embeds it).
    pub fn update_local(&self) {
        let mut state = self.state.lock();
        if !state.finished {
            return;
        }
        let (Some(seed), Some(proof)) = (state.result_seed.take(), state.result_proof.take())
        else {
            return;
        };
        state.seed = seed;
        state.proof = proof;
        state.finished = false;
        drop(state);
        debug!("VDF advanced from local result");
        self.notify.notify_waiters();
    }

    /// Round output to embed in a coinbase: the finished result when the
    /// round completed, otherwise the current input.
    pub fn delay_params(&self) -> Option<DelayParams> {
        self.params.lock().as_ref()?;
        let state = self.state.lock();
        let (seed, proof) = if state.finished {
            (state.result_seed.clone()?, state.result_proof.clone()?)
        } else {
            (state.seed.clone(), state.proof.clone())
        };
        Some(DelayParams {
            order: None,
            time_param: None,
            seed: int_to_hex(&seed),
            proof: Some(int_to_hex(&proof)),
            verify_param: None,
        })
    }

    /// Check a remote round output: `result == proof^l · seed^(2^T mod l)
    /// mod N`.
    pub fn verify(&self, result_hex: &str, proof_hex: &str, seed_hex: &str) -> bool {
        let Some(params) = self.params.lock().clone() else {
            return false;
        };
        let (Some(result), Some(proof), Some(seed)) = (
            hex_to_int(result_hex),
            hex_to_int(proof_hex),
            hex_to_int(seed_hex),
        ) else {
            return false;
        };
        verify_with_params(&params, &result, &proof, &seed)
    }

    /// Eligibility oracle: hash the address into [0, 2^256) with the
    /// current seed and compare the fraction against the threshold.
    pub fn is_consensus_node(&self, addr: &str) -> bool {
        if self.params.lock().is_none() {
            return false;
        }
        let Ok(addr_int) = address::to_int(addr) else {
            debug!(%addr, "Address does not decode, not a consensus node");
            return false;
        };
        let seed = self.state.lock().seed.clone();
        let modulus = BigUint::one() << 256;
        let node_hash: BigUint = (seed * addr_int) % &modulus;
        let fraction = node_hash.to_f64().unwrap_or(0.0) / 2f64.powi(256);
        fraction <= self.eligibility_threshold
    }

    pub fn is_initialized(&self) -> bool {
        self.params.lock().is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Worker loop: sleep while finished or uninitialized, otherwise run one
    /// round of T squarings off the async runtime.
    pub async fn run(self: Arc<Self>, chain: Arc<ChainStore>, shutdown: CancellationToken) {
        loop {
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let ready = self.init_from_chain(&chain) && !self.state.lock().finished;
                if ready {
                    break;
                }
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {}
                }
            }

            let params = self.params.lock().clone().expect("initialized above");
            let seed = self.state.lock().seed.clone();
            let cancel = self.changed.clone();
            let handle = tokio::task::spawn_blocking(move || {
                compute_round(&params, seed, &cancel)
            });

            let outcome = tokio::select! {
                joined = handle => joined,
                _ = shutdown.cancelled() => {
                    self.changed.store(true, Ordering::Relaxed);
                    return;
                }
            };

            match outcome {
                Ok(Some((result, proof))) => {
                    // A seed change that landed right at completion voids
                    // the result.
                    if self.changed.swap(false, Ordering::Relaxed) {
                        debug!("VDF result discarded, seed changed at completion");
                        continue;
                    }
                    let mut state = self.state.lock();
                    state.result_seed = Some(result);
                    state.result_proof = Some(proof);
                    state.finished = true;
                    debug!("VDF round finished");
                }
                Ok(None) => {
                    debug!("VDF round aborted, seed changed");
                    self.changed.store(false, Ordering::Relaxed);
                }
                Err(e) => warn!(error = %e, "VDF worker join failed"),
            }
        }
    }
}

/// One round of T squarings with the proof accumulated alongside:
/// `b = floor(2r/l)`, `r = 2r mod l`, `pi = pi^2 · g^b mod N`.
fn compute_round(
    params: &VdfParams,
    seed: BigUint,
    cancel: &AtomicBool,
) -> Option<(BigUint, BigUint)> {
    let n = &params.order;
    let l = &params.verify_param;
    let g = seed.clone();
    let mut result = seed;
    let mut pi = BigUint::one();
    let mut r = BigUint::one();

    for _ in 0..params.time_param {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        result = &result * &result % n;

        let two_r = &r << 1;
        let b = &two_r / l;
        r = two_r % l;
        pi = (&pi * &pi % n) * g.modpow(&b, n) % n;
    }
    Some((result, pi))
}

pub fn verify_with_params(
    params: &VdfParams,
    result: &BigUint,
    proof: &BigUint,
    seed: &BigUint,
) -> bool {
    let r = BigUint::from(2u8).modpow(&BigUint::from(params.time_param), &params.verify_param);
    let check = proof.modpow(&params.verify_param, &params.order)
        * seed.modpow(&r, &params.order)
        % &params.order;
    *result == check
}

/// Run one full round synchronously; used by the genesis builder and tests.
pub fn compute_once(params: &VdfParams, seed: BigUint) -> (BigUint, BigUint) {
    compute_round(params, seed, &AtomicBool::new(false)).expect("uncancelled round completes")
}

pub fn hex_to_int(hex: &str) -> Option<BigUint> {
    BigUint::parse_bytes(hex.as_bytes(), 16)
}

pub fn int_to_hex(value: &BigUint) -> String {
    value.to_str_radix(16)
}

fn miller_rabin(candidate: &BigUint) -> bool {
    let one = BigUint::one();
    let two = BigUint::from(2u8);
    if *candidate < two {
        return false;
    }
    if *candidate == two {
        return true;
    }
    if candidate % &two == BigUint::zero() {
        return false;
    }

    let minus_one = candidate - &one;
    let mut m = minus_one.clone();
    let mut k = 0u32;
    while &m % &two == BigUint::zero() {
        m >>= 1;
        k += 1;
    }

    let mut rng = OsRng;
    let base = rng.gen_biguint_range(&two, &minus_one);
    let mut x = base.modpow(&m, candidate);
    if x == one || x == minus_one {
        return true;
    }
    for _ in 1..k {
        x = x.modpow(&two, candidate);
        if x == one {
            return false;
        }
        if x == minus_one {
            return true;
        }
    }
    false
}

pub fn is_prime(candidate: &BigUint) -> bool {
    (0..MILLER_RABIN_ROUNDS).all(|_| miller_rabin(candidate))
}

/// Random prime with the requested bit length.
pub fn generate_prime(bits: u64) -> BigUint {
    let mut rng = OsRng;
    loop {
        let mut candidate = rng.gen_biguint(bits);
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(0, true);
        if is_prime(&candidate) {
            return candidate;
        }
    }
}

/// Fresh genesis parameters: N = p·q from two primes of `modulus_bits / 2`
/// bits, a proving prime, and a random seed below N.
pub fn generate_params(modulus_bits: u64, time_param: u64) -> (VdfParams, BigUint) {
    let p = generate_prime(modulus_bits / 2);
    let q = generate_prime(modulus_bits / 2);
    let order = p * q;
    let verify_param = generate_prime(128);
    let seed = OsRng.gen_biguint_below(&order);
    (
        VdfParams {
            order,
            time_param,
            verify_param,
        },
        seed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_params(time_param: u64) -> VdfParams {
        // 61 and 53 are primes; tiny modulus keeps the loop instant.
        VdfParams {
            order: BigUint::from(61u32 * 53u32),
            time_param,
            verify_param: BigUint::from(13u32),
        }
    }

    #[test]
    fn prime_tester_agrees_with_known_values() {
        assert!(is_prime(&BigUint::from(2u8)));
        assert!(is_prime(&BigUint::from(7919u32)));
        assert!(!is_prime(&BigUint::from(7917u32)));
        assert!(!is_prime(&BigUint::from(1u8)));
    }

    #[test]
    fn generated_primes_have_requested_size() {
        let p = generate_prime(64);
        assert_eq!(p.bits(), 64);
        assert!(is_prime(&p));
    }

    #[test]
    fn round_output_verifies() {
        let params = small_params(50);
        let seed = BigUint::from(17u32);
        let (result, proof) = compute_once(&params, seed.clone());
        assert!(verify_with_params(&params, &result, &proof, &seed));
    }

    #[test]
    fn perturbed_output_fails_verification() {
        let params = small_params(50);
        let seed = BigUint::from(17u32);
        let (result, proof) = compute_once(&params, seed.clone());

        let bad_result = &result + BigUint::one();
        assert!(!verify_with_params(&params, &bad_result, &proof, &seed));

        let bad_seed = &seed + BigUint::one();
        assert!(!verify_with_params(&params, &result, &proof, &bad_seed));
    }

    #[test]
    fn generated_params_roundtrip() {
        let (params, seed) = generate_params(128, 32);
        let (result, proof) = compute_once(&params, seed.clone());
        assert!(verify_with_params(&params, &result, &proof, &seed));
    }

    #[test]
    fn hex_conversions() {
        let n = BigUint::from(0xdeadbeefu32);
        assert_eq!(hex_to_int(&int_to_hex(&n)).unwrap(), n);
        assert!(hex_to_int("not hex").is_none());
    }
}
