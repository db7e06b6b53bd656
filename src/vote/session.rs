use crate::crypto::asymmetric::PublicKey;
use crate::crypto::{HmacSigner, KeyPair, SymmetricKey};

/// Everything a Post needs to encrypt and sign a voter's ballots.
#[derive(Clone)]
pub struct VotingSession {
    /// The counting authority's public key, received from the Urn.
    pub counting_key: PublicKey,
    /// Derived from the Post's pre-shared secret; nonces travel under it.
    pub session_key: SymmetricKey,
    /// Keyed by the same pre-shared secret.
    pub signer: HmacSigner,
    /// The Post's own signing key.
    pub booth: KeyPair,
}

impl VotingSession {
    pub fn new(counting_key: PublicKey, secret: &str, booth: KeyPair) -> Self {
        Self {
            counting_key,
            session_key: SymmetricKey::from_secret(secret),
            signer: HmacSigner::new(secret),
            booth,
        }
    }
}
