//! Mutual authentication between a terminal and the Urn.
//!
//! The initiator proves knowledge of the pre-shared session key by having
//! the Urn solve its nonce, then solving the Urn's nonce in return. Each
//! phase runs over its own connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::crypto::SymmetricKey;
use crate::net::Network;

pub mod initiator;
pub mod liveness;
pub mod responder;

pub use initiator::authenticate;
pub use liveness::{keep_alive, KeepAlive, Liveness};
pub use responder::{NonceRegistry, Phase};

/// Message kinds exchanged during authentication.
pub mod kind {
    pub const PHASE_ONE: &str = "authPhaseOne";
    pub const PHASE_ONE_REPLY: &str = "authPhaseOneReply";
    pub const PHASE_TWO: &str = "authPhaseTwo";
    pub const PHASE_TWO_REPLY: &str = "authPhaseTwoReply";
    pub const LIVENESS: &str = "checkAuthentication";
    pub const LIVENESS_REPLY: &str = "checkAuthenticationReply";
}

/// Field names shared by the authentication messages.
pub mod field {
    pub const NONCE: &str = "nonce";
    pub const SOLVED_NONCE: &str = "solvedNonce";
}

/// How a terminal reaches the Urn and proves who it is.
#[derive(Clone)]
pub struct UrnContact {
    pub network: Arc<dyn Network>,
    pub urn: SocketAddr,
    secret: String,
    key: SymmetricKey,
}

impl UrnContact {
    pub fn new(network: Arc<dyn Network>, urn: SocketAddr, secret: impl Into<String>) -> Self {
        let secret = secret.into();
        let key = SymmetricKey::from_secret(&secret);
        Self {
            network,
            urn,
            secret,
            key,
        }
    }

    /// The pre-shared secret the session key and HMAC key derive from.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn key(&self) -> &SymmetricKey {
        &self.key
    }
}
