//! Base58-check address codec.
//!
//! Address layout: version byte, 20 payload bytes (truncated SHA-256 of the
//! public key), 4 checksum bytes (double SHA-256), base58-encoded.

use num_bigint::BigUint;
use num_traits::Zero;
use sha2::{Digest, Sha256};

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const VERSION: u8 = 0x00;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 character")]
    InvalidCharacter,

    #[error("address payload has wrong length")]
    InvalidLength,

    #[error("address checksum mismatch")]
    ChecksumMismatch,
}

pub fn from_pubkey_bytes(pubkey: &[u8]) -> String {
    let digest = Sha256::digest(pubkey);
    let mut raw = Vec::with_capacity(25);
    raw.push(VERSION);
    raw.extend_from_slice(&digest[..20]);
    let check = checksum(&raw);
    raw.extend_from_slice(&check);
    encode(&raw)
}

/// Decode and checksum-verify, returning the version byte plus payload.
pub fn decode_check(address: &str) -> Result<Vec<u8>, AddressError> {
    let raw = decode(address)?;
    if raw.len() != 25 {
        return Err(AddressError::InvalidLength);
    }
    let (body, check) = raw.split_at(21);
    if checksum(body) != check[..4] {
        return Err(AddressError::ChecksumMismatch);
    }
    Ok(body.to_vec())
}

pub fn is_valid(address: &str) -> bool {
    decode_check(address).is_ok()
}

/// Big-endian integer view of a decoded address, used by the consensus
/// eligibility hash.
pub fn to_int(address: &str) -> Result<BigUint, AddressError> {
    Ok(BigUint::from_bytes_be(&decode_check(address)?))
}

fn checksum(data: &[u8]) -> [u8; 4] {
    let once = Sha256::digest(data);
    let twice = Sha256::digest(once);
    [twice[0], twice[1], twice[2], twice[3]]
}

fn encode(data: &[u8]) -> String {
    let mut n = BigUint::from_bytes_be(data);
    let base = BigUint::from(58u8);
    let mut out = Vec::new();
    while !n.is_zero() {
        let rem = (&n % &base).to_u32_digits().first().copied().unwrap_or(0);
        out.push(BASE58_ALPHABET[rem as usize]);
        n /= &base;
    }
    // Leading zero bytes map to the first alphabet character.
    for byte in data {
        if *byte != 0 {
            break;
        }
        out.push(BASE58_ALPHABET[0]);
    }
    out.reverse();
    String::from_utf8(out).expect("alphabet is ascii")
}

fn decode(s: &str) -> Result<Vec<u8>, AddressError> {
    let mut n = BigUint::zero();
    let base = BigUint::from(58u8);
    for ch in s.bytes() {
        let digit = BASE58_ALPHABET
            .iter()
            .position(|c| *c == ch)
            .ok_or(AddressError::InvalidCharacter)?;
        n = &n * &base + BigUint::from(digit as u32);
    }
    let mut bytes = n.to_bytes_be();
    if bytes == [0] {
        bytes.clear();
    }
    let leading = s
        .bytes()
        .take_while(|c| *c == BASE58_ALPHABET[0])
        .count();
    let mut out = vec![0u8; leading];
    out.extend_from_slice(&bytes);
    Ok(out)
}
