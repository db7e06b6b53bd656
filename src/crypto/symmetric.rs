use std::fmt::{Debug, Formatter};

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use data_encoding::BASE64;
use rand::RngCore;

use crate::crypto::hash::sha256;
use crate::error::{Code, Error, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;

/// An AES-256-CBC key together with the IV it is always used with.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SymmetricKey {
    /// Derive a key and IV from an arbitrary-length shared secret.
    ///
    /// The key is the SHA-256 digest of the secret; the IV is the digest of
    /// that digest, truncated, so the two never share bytes.
    pub fn from_secret(secret: impl AsRef<[u8]>) -> Self {
        let key = sha256(secret);
        let mut iv = [0; IV_LEN];
        iv.copy_from_slice(&sha256(key)[..IV_LEN]);
        Self { key, iv }
    }

    /// A fresh key derived from a random seed.
    pub fn random() -> Self {
        let mut seed = [0; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_secret(BASE64.encode(&seed))
    }

    /// Rebuild a key from raw key and IV bytes, e.g. after unwrapping them.
    pub fn from_parts(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
            Error::new(
                Code::Key,
                format!("expected a {KEY_LEN} byte key, got {}", key.len()),
            )
        })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            Error::new(
                Code::Key,
                format!("expected a {IV_LEN} byte IV, got {}", iv.len()),
            )
        })?;
        Ok(Self { key, iv })
    }

    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    pub fn iv_bytes(&self) -> &[u8] {
        &self.iv
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::new(Code::Cipher, "bad padding in symmetric ciphertext"))
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Vec<u8> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, ciphertext: &[u8]) -> Result<String> {
        let plain = self.decrypt(ciphertext)?;
        String::from_utf8(plain)
            .map_err(|_| Error::new(Code::Cipher, "symmetric plaintext is not UTF-8"))
    }
}

/// Never print key material.
impl Debug for SymmetricKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = SymmetricKey::from_secret("station-7 session secret");
        let b = SymmetricKey::from_secret("station-7 session secret");
        let c = SymmetricKey::from_secret("station-8 session secret");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(&a.key_bytes()[..IV_LEN], a.iv_bytes());
    }

    #[test]
    fn round_trip_and_wrong_key() {
        let key = SymmetricKey::random();
        let ciphertext = key.encrypt_str("candidate-12");
        assert_eq!(ciphertext.len() % 16, 0);
        assert_eq!(key.decrypt_str(&ciphertext).unwrap(), "candidate-12");

        let other = SymmetricKey::random();
        let recovered = other.decrypt_str(&ciphertext);
        assert!(recovered.map(|s| s != "candidate-12").unwrap_or(true));
    }

    #[test]
    fn from_parts_checks_lengths() {
        let key = SymmetricKey::random();
        let rebuilt = SymmetricKey::from_parts(key.key_bytes(), key.iv_bytes()).unwrap();
        assert_eq!(key, rebuilt);
        let err = SymmetricKey::from_parts(&key.key_bytes()[..16], key.iv_bytes()).unwrap_err();
        assert_eq!(err.code(), Code::Key);
    }

    #[test]
    fn debug_hides_material() {
        assert_eq!(format!("{:?}", SymmetricKey::random()), "SymmetricKey(..)");
    }
}
