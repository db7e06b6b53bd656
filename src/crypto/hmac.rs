use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Code, Error, Result};

pub type HmacSha256 = Hmac<Sha256>;

pub const SALT_LEN: usize = 16;

/// Derive HMAC keys from a shared password and sign ordered lists of message parts.
///
/// Each signature uses a fresh salt, so the derived key differs per signature;
/// the salt travels alongside the MAC.
#[derive(Clone)]
pub struct HmacSigner {
    password: Vec<u8>,
}

impl HmacSigner {
    pub fn new(password: impl AsRef<[u8]>) -> Self {
        Self {
            password: password.as_ref().to_vec(),
        }
    }

    /// Sign `parts` in order, returning `(salt, mac)`.
    pub fn sign<P: AsRef<[u8]>>(&self, parts: &[P]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut salt = vec![0; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mac = self.keyed(&salt, parts)?.finalize().into_bytes().to_vec();
        Ok((salt, mac))
    }

    /// Recompute the MAC with the stored salt. The comparison is constant-time.
    pub fn verify<P: AsRef<[u8]>>(&self, parts: &[P], salt: &[u8], mac: &[u8]) -> bool {
        match self.keyed(salt, parts) {
            Ok(hmac) => hmac.verify_slice(mac).is_ok(),
            Err(e) => {
                debug!("HMAC key derivation failed during verification: {e}");
                false
            }
        }
    }

    fn keyed<P: AsRef<[u8]>>(&self, salt: &[u8], parts: &[P]) -> Result<HmacSha256> {
        let key = derive_key(&self.password, salt)?;
        let mut hmac = HmacSha256::new_from_slice(&key)
            .map_err(|e| Error::new(Code::Hmac, e.to_string()))?;
        for part in parts {
            let part = part.as_ref();
            // Length prefix, so that ["ab", "c"] and ["a", "bc"] differ.
            hmac.update(&(part.len() as u64).to_be_bytes());
            hmac.update(part);
        }
        Ok(hmac)
    }
}

/// Iterated, salted password-based key derivation.
fn derive_key(password: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    if salt.len() < 8 {
        return Err(Error::new(Code::Hmac, "HMAC salt too short"));
    }
    let config = argon2::Config {
        mem_cost: 1024,
        time_cost: 2,
        ..argon2::Config::default()
    };
    Ok(argon2::hash_raw(password, salt, &config)?)
}
