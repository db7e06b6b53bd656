use std::net::SocketAddr;

use async_trait::async_trait;

use crate::auth::{field, kind, UrnContact};
use crate::crypto::{nonce, Challenge, SymmetricKey};
use crate::error::{Code, Error, Result};
use crate::net::Network;
use crate::protocol::{self, Command, FieldType, Message};

/// Result of one liveness check against the Urn.
#[derive(Debug)]
pub enum Liveness {
    /// The Urn still recognises this terminal.
    Confirmed,
    /// The Urn could not be reached. The terminal keeps its authentication.
    Unreachable(Error),
    /// The Urn rejected the terminal or answered the challenge wrongly.
    Revoked(Error),
}

impl Liveness {
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Revoked(_))
    }
}

/// Ask the Urn whether it still trusts us, proving it knows our key.
pub async fn check(network: &dyn Network, urn: SocketAddr, key: &SymmetricKey) -> Liveness {
    let ours = nonce::generate();
    let ping = Message::new(kind::LIVENESS).with_bytes(field::NONCE, nonce::encrypt(key, ours));
    let reply = match protocol::request(network, urn, Command::CheckAuthentication, &ping).await {
        Ok(reply) => reply,
        Err(err) if err.is_connection() => {
            debug!("Urn at {urn} unreachable, keeping authentication: {err}");
            return Liveness::Unreachable(err);
        }
        Err(err) => return Liveness::Revoked(err),
    };
    let reply = match reply.verify(kind::LIVENESS_REPLY, &[(field::SOLVED_NONCE, FieldType::Bytes)]) {
        Ok(reply) => reply,
        Err(err) => {
            warn!("Urn at {urn} refused the liveness check: {err}");
            return Liveness::Revoked(err);
        }
    };
    match reply.bytes(field::SOLVED_NONCE) {
        Ok(solved) if nonce::verify_challenge(ours, solved, key, Challenge::AuthPhaseOne) => {
            trace!("Urn at {urn} confirmed our authentication");
            Liveness::Confirmed
        }
        _ => {
            warn!("Urn at {urn} failed the liveness challenge");
            Liveness::Revoked(Error::new(
                Code::Authentication,
                format!("urn at {urn} failed the liveness challenge"),
            ))
        }
    }
}

/// A terminal that must stay authenticated with the Urn.
#[async_trait]
pub trait KeepAlive: Send + Sync {
    fn contact(&self) -> &UrnContact;

    fn is_authenticated(&self) -> bool;

    async fn authenticate(&self) -> Result<()>;

    /// The Urn no longer trusts this terminal.
    async fn invalid_authentication(&self, err: Error);
}

/// One round of the liveness poller.
///
/// An unauthenticated terminal tries to authenticate again; an authenticated
/// one checks that the Urn still knows it.
pub async fn keep_alive<T: KeepAlive + ?Sized>(terminal: &T) {
    let contact = terminal.contact();
    if !terminal.is_authenticated() {
        match terminal.authenticate().await {
            Ok(()) => info!("Authenticated with the urn at {}", contact.urn),
            Err(err) => debug!("Authentication with the urn at {} failed: {err}", contact.urn),
        }
        return;
    }
    if let Liveness::Revoked(err) = check(contact.network.as_ref(), contact.urn, contact.key()).await {
        warn!("Authentication revoked by the urn at {}: {err}", contact.urn);
        terminal.invalid_authentication(err).await;
    }
}
