use std::fmt::{Debug, Formatter};
use std::path::Path;

use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::crypto::hash::DIGEST_LEN;
use crate::error::{Code, Error, Result};

pub use rsa::RsaPublicKey as PublicKey;

/// Modulus size for keys generated at runtime.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// An RSA key pair: used by the Urn as the counting authority, and by each
/// Post to sign the ballots it submits.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

impl KeyPair {
    pub fn generate(bits: usize) -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)?;
        Ok(Self::from_private(private))
    }

    pub fn from_private(private: RsaPrivateKey) -> Self {
        let public = RsaPublicKey::from(&private);
        Self { private, public }
    }

    /// Parse a PKCS#8 PEM private key.
    pub fn from_pem(pem: &str) -> Result<Self> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)
            .map_err(|e| Error::new(Code::Key, format!("invalid private key: {e}")))?;
        Ok(Self::from_private(private))
    }

    /// Load a PKCS#8 PEM private key from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::new(
                Code::Key,
                format!("cannot read key file {}: {e}", path.display()),
            )
        })?;
        Self::from_pem(&pem)
    }

    pub fn to_pem(&self) -> Result<String> {
        self.private
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| pem.to_string())
            .map_err(|e| Error::new(Code::Key, e.to_string()))
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    /// Recover data wrapped for this key pair with [`wrap`].
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|e| Error::new(Code::Cipher, format!("cannot unwrap key material: {e}")))
    }

    /// Sign a full-length SHA-256 digest.
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>> {
        if digest.len() != DIGEST_LEN {
            return Err(Error::new(
                Code::Signature,
                format!("expected a {DIGEST_LEN} byte digest, got {}", digest.len()),
            ));
        }
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|e| Error::new(Code::Signature, e.to_string()))
    }
}

impl Debug for KeyPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyPair(..)")
    }
}

/// Encrypt small key material (a symmetric key or IV) for the holder of `public`.
pub fn wrap(public: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>> {
    public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
        .map_err(|e| Error::new(Code::Cipher, format!("cannot wrap key material: {e}")))
}

/// Check a signature made with [`KeyPair::sign_digest`].
pub fn verify_digest(public: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> bool {
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
        .is_ok()
}

/// DER (SubjectPublicKeyInfo) encoding, as carried inside messages.
pub fn encode_public_key(public: &RsaPublicKey) -> Result<Vec<u8>> {
    public
        .to_public_key_der()
        .map(|der| der.as_bytes().to_vec())
        .map_err(|e| Error::new(Code::Key, e.to_string()))
}

pub fn decode_public_key(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| Error::new(Code::Key, format!("invalid public key: {e}")))
}

/// Small keys shared across the test suite; generating RSA keys is slow.
#[cfg(test)]
pub mod examples {
    use std::sync::OnceLock;

    use super::KeyPair;

    pub const TEST_KEY_BITS: usize = 1024;

    pub fn counting_authority() -> &'static KeyPair {
        static KEY: OnceLock<KeyPair> = OnceLock::new();
        KEY.get_or_init(|| KeyPair::generate(TEST_KEY_BITS).unwrap())
    }

    pub fn booth(index: usize) -> &'static KeyPair {
        static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
        let keys = KEYS.get_or_init(|| {
            (0..3)
                .map(|_| KeyPair::generate(TEST_KEY_BITS).unwrap())
                .collect()
        });
        &keys[index % keys.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::examples::{booth, counting_authority};
    use super::*;
    use crate::crypto::hash::sha256;

    #[test]
    fn wrap_round_trip() {
        let pair = counting_authority();
        let wrapped = wrap(pair.public(), b"0123456789abcdef").unwrap();
        assert_eq!(pair.unwrap(&wrapped).unwrap(), b"0123456789abcdef");
        assert!(booth(0).unwrap(&wrapped).is_err());
    }

    #[test]
    fn signatures_bind_digest_and_key() {
        let digest = sha256(b"packet fields");
        let signature = booth(0).sign_digest(&digest).unwrap();
        assert!(verify_digest(booth(0).public(), &digest, &signature));
        assert!(!verify_digest(booth(1).public(), &digest, &signature));
        assert!(!verify_digest(
            booth(0).public(),
            &sha256(b"other fields"),
            &signature
        ));
        assert!(booth(0).sign_digest(&digest[..16]).is_err());
    }

    #[test]
    fn public_key_der_round_trip() {
        let der = encode_public_key(booth(2).public()).unwrap();
        assert_eq!(&decode_public_key(&der).unwrap(), booth(2).public());
        assert!(decode_public_key(&der[1..]).is_err());
    }

    #[test]
    fn pem_round_trip() {
        let pem = booth(1).to_pem().unwrap();
        let pair = KeyPair::from_pem(&pem).unwrap();
        assert_eq!(pair.public(), booth(1).public());
    }
}
