use serde::{Deserialize, Serialize};

use crate::crypto::asymmetric::{self, PublicKey};
use crate::crypto::hash::{digest, DIGEST_LEN};
use crate::crypto::{HmacSigner, KeyPair, SymmetricKey};
use crate::error::{Code, Error, Result};
use crate::model::encoding::{base64_bytes, base64_option};

/// One encrypted preference.
///
/// The choice is encrypted under a fresh symmetric key, which is wrapped for
/// the counting authority. The packet may then be HMAC-signed and
/// signature-signed, in that order; once signed it can no longer change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotePacket {
    #[serde(with = "base64_bytes")]
    encrypted_vote: Vec<u8>,
    #[serde(with = "base64_bytes")]
    encrypted_key: Vec<u8>,
    #[serde(with = "base64_bytes")]
    encrypted_iv: Vec<u8>,
    #[serde(with = "base64_option", default)]
    salt: Option<Vec<u8>>,
    #[serde(with = "base64_option", default)]
    hmac: Option<Vec<u8>>,
    #[serde(with = "base64_option", default)]
    signature: Option<Vec<u8>>,
}

impl VotePacket {
    pub fn encrypt(choice: &str, counting_key: &PublicKey) -> Result<Self> {
        let key = SymmetricKey::random();
        Ok(Self {
            encrypted_vote: key.encrypt_str(choice),
            encrypted_key: asymmetric::wrap(counting_key, key.key_bytes())?,
            encrypted_iv: asymmetric::wrap(counting_key, key.iv_bytes())?,
            salt: None,
            hmac: None,
            signature: None,
        })
    }

    /// Recover the plaintext choice. Only the counting authority can do this.
    pub fn decrypt(&self, counting_authority: &KeyPair) -> Result<String> {
        let key = SymmetricKey::from_parts(
            &counting_authority.unwrap(&self.encrypted_key)?,
            &counting_authority.unwrap(&self.encrypted_iv)?,
        )?;
        key.decrypt_str(&self.encrypted_vote)
    }

    pub fn encrypted_vote(&self) -> &[u8] {
        &self.encrypted_vote
    }

    pub fn encrypted_key(&self) -> &[u8] {
        &self.encrypted_key
    }

    pub fn encrypted_iv(&self) -> &[u8] {
        &self.encrypted_iv
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn has_hmac(&self) -> bool {
        self.hmac.is_some()
    }

    fn ensure_unsigned(&self) -> Result<()> {
        if self.is_signed() {
            return Err(Error::wrong_state("vote packet is already signed"));
        }
        Ok(())
    }

    /// HMAC the encrypted fields together with `bound`, the data this packet is tied to.
    pub fn sign_hmac(&mut self, signer: &HmacSigner, bound: &[u8]) -> Result<()> {
        self.ensure_unsigned()?;
        if self.has_hmac() {
            return Err(Error::wrong_state("vote packet already carries an HMAC"));
        }
        let (salt, hmac) = signer.sign(&self.hmac_parts(bound))?;
        self.salt = Some(salt);
        self.hmac = Some(hmac);
        Ok(())
    }

    pub fn verify_hmac(&self, signer: &HmacSigner, bound: &[u8]) -> bool {
        match (&self.salt, &self.hmac) {
            (Some(salt), Some(hmac)) => signer.verify(&self.hmac_parts(bound), salt, hmac),
            _ => false,
        }
    }

    fn hmac_parts<'a>(&'a self, bound: &'a [u8]) -> [&'a [u8]; 4] {
        [
            self.encrypted_vote.as_slice(),
            self.encrypted_key.as_slice(),
            self.encrypted_iv.as_slice(),
            bound,
        ]
    }

    /// Digest of the fields a signature covers.
    fn signed_digest(&self) -> Result<Vec<u8>> {
        digest(
            &[
                &self.encrypted_vote[..],
                &self.encrypted_key[..],
                &self.encrypted_iv[..],
            ],
            DIGEST_LEN,
        )
    }

    /// Sign with the booth's private key, freezing the packet.
    pub fn sign(&mut self, booth: &KeyPair) -> Result<()> {
        self.ensure_unsigned()?;
        self.signature = Some(booth.sign_digest(&self.signed_digest()?)?);
        Ok(())
    }

    pub fn verify_signature(&self, booth: &PublicKey) -> bool {
        let Some(signature) = &self.signature else {
            return false;
        };
        match self.signed_digest() {
            Ok(digest) => asymmetric::verify_digest(booth, &digest, signature),
            Err(_) => false,
        }
    }

    /// Check both the HMAC and the signature, naming whichever fails.
    pub fn verify(&self, signer: &HmacSigner, bound: &[u8], booth: &PublicKey) -> Result<()> {
        if !self.verify_hmac(signer, bound) {
            return Err(Error::new(Code::Hmac, "vote packet HMAC does not match"));
        }
        if !self.verify_signature(booth) {
            return Err(Error::new(Code::Signature, "vote packet signature does not match"));
        }
        Ok(())
    }
}
