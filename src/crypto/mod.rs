//! Cryptographic primitives shared by every terminal type.

pub mod asymmetric;
pub mod hash;
pub mod hmac;
pub mod nonce;
pub mod symmetric;

pub use asymmetric::KeyPair;
pub use self::hmac::HmacSigner;
pub use nonce::Challenge;
pub use symmetric::SymmetricKey;
