use crate::crypto::{nonce, SymmetricKey};
use crate::error::{Error, Result};
use crate::protocol::Value;

/// Encrypt a batch of vote nonces, one list per ballot, for the wire.
pub fn seal(key: &SymmetricKey, batch: &[Vec<i64>]) -> Value {
    Value::List(
        batch
            .iter()
            .map(|nonces| {
                Value::List(
                    nonces
                        .iter()
                        .map(|&issued| Value::Bytes(nonce::encrypt(key, issued)))
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Reverse [`seal`].
pub fn open(key: &SymmetricKey, sealed: &[Value]) -> Result<Vec<Vec<i64>>> {
    sealed
        .iter()
        .map(|ballot| match ballot {
            Value::List(nonces) => nonces
                .iter()
                .map(|sealed_nonce| match sealed_nonce {
                    Value::Bytes(ciphertext) => nonce::decrypt(key, ciphertext),
                    other => Err(Error::malformed(format!(
                        "expected an encrypted nonce, got {:?}",
                        other.field_type()
                    ))),
                })
                .collect(),
            other => Err(Error::malformed(format!(
                "expected a list of nonces, got {:?}",
                other.field_type()
            ))),
        })
        .collect()
}
