use sha2::{Digest, Sha256};

use crate::error::{Code, Error, Result};

/// Full length of the digest, in bytes.
pub const DIGEST_LEN: usize = 32;

/// Hash the concatenation of `parts`, truncated to `len` bytes.
pub fn digest<P: AsRef<[u8]>>(parts: &[P], len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > DIGEST_LEN {
        return Err(Error::new(
            Code::Key,
            format!("digest length must be within 1..={DIGEST_LEN}, got {len}"),
        ));
    }
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
    }
    Ok(hasher.finalize()[..len].to_vec())
}

/// Full-length digest of a single byte string.
pub fn sha256(data: impl AsRef<[u8]>) -> [u8; DIGEST_LEN] {
    Sha256::digest(data.as_ref()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_a_prefix() {
        let full = digest(&[b"ballot".as_slice(), b"42".as_slice()], DIGEST_LEN).unwrap();
        let short = digest(&[b"ballot".as_slice(), b"42".as_slice()], 16).unwrap();
        assert_eq!(&full[..16], short.as_slice());
        assert_eq!(full, sha256(b"ballot42").to_vec());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(digest(&[b"x"], 0).is_err());
        assert!(digest(&[b"x"], DIGEST_LEN + 1).is_err());
    }
}
