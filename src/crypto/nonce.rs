use std::collections::HashSet;

use rand::distributions::{Distribution, Uniform};
use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::crypto::SymmetricKey;
use crate::error::{Code, Error, Result};

/// Smallest nonce ever issued. Keeping nonces above 30 guarantees the three
/// transforms produce different values for the same nonce.
pub const MIN_NONCE: i64 = 1_000;
/// Nonces stay within `i32` so that every transform fits comfortably.
pub const MAX_NONCE: i64 = i32::MAX as i64;

/// The fixed challenge transforms, one per protocol phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Challenge {
    /// Urn's answer to the initiator's first nonce.
    AuthPhaseOne = 1,
    /// Initiator's answer to the Urn's nonce.
    AuthPhaseTwo = 2,
    /// Binds a single encrypted preference to the nonce the Urn issued for it.
    Vote = 3,
}

impl Challenge {
    pub fn solve(&self, nonce: i64) -> i64 {
        match self {
            Self::AuthPhaseOne => nonce + 1,
            Self::AuthPhaseTwo => nonce * 2,
            Self::Vote => nonce + 30,
        }
    }
}

/// Generate a single random nonce.
pub fn generate() -> i64 {
    Uniform::new(MIN_NONCE, MAX_NONCE).sample(&mut rand::thread_rng())
}

/// Generate one nonce per expressible preference, for each entry of
/// `preferences_per_ballot`. No value repeats across the whole batch.
pub fn generate_batch(preferences_per_ballot: &[usize]) -> Vec<Vec<i64>> {
    let distribution = Uniform::new(MIN_NONCE, MAX_NONCE);
    let mut rng = rand::thread_rng();
    let mut used = HashSet::new();
    preferences_per_ballot
        .iter()
        .map(|&count| {
            let mut nonces = Vec::with_capacity(count);
            while nonces.len() < count {
                let nonce = distribution.sample(&mut rng);
                if used.insert(nonce) {
                    nonces.push(nonce);
                }
            }
            nonces
        })
        .collect()
}

pub fn encrypt(key: &SymmetricKey, nonce: i64) -> Vec<u8> {
    key.encrypt_str(&nonce.to_string())
}

pub fn decrypt(key: &SymmetricKey, ciphertext: &[u8]) -> Result<i64> {
    key.decrypt_str(ciphertext)?
        .parse()
        .map_err(|_| Error::new(Code::Cipher, "decrypted nonce is not an integer"))
}

/// Decrypt a nonce issued by a peer and return the encrypted solution.
pub fn solve_encrypted(key: &SymmetricKey, ciphertext: &[u8], challenge: Challenge) -> Result<Vec<u8>> {
    let nonce = decrypt(key, ciphertext)?;
    Ok(encrypt(key, challenge.solve(nonce)))
}

/// Does `response` decrypt, under `key`, to the expected solution of `nonce`?
pub fn verify_challenge(nonce: i64, response: &[u8], key: &SymmetricKey, challenge: Challenge) -> bool {
    match decrypt(key, response) {
        Ok(solution) => solution == challenge.solve(nonce),
        Err(_) => false,
    }
}
