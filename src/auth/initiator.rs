use std::net::SocketAddr;

use crate::auth::{field, kind};
use crate::crypto::{nonce, Challenge, SymmetricKey};
use crate::error::{Code, Error, Result};
use crate::model::TerminalKind;
use crate::net::Network;
use crate::protocol::{self, Command, FieldType, Message, Value, Verified};

/// Run both authentication phases against the Urn at `urn`.
///
/// `extra` travels with the phase two answer. On success the Urn's final
/// acknowledgement is returned, verified against `bootstrap`. Every attempt
/// uses fresh nonces and nothing is kept from a failed one.
pub async fn authenticate(
    network: &dyn Network,
    urn: SocketAddr,
    terminal: TerminalKind,
    key: &SymmetricKey,
    extra: Vec<(&str, Value)>,
    bootstrap: &[(&str, FieldType)],
) -> Result<Message<Verified>> {
    // Phase one: challenge the Urn.
    let ours = nonce::generate();
    let hello = Message::new(kind::PHASE_ONE).with_bytes(field::NONCE, nonce::encrypt(key, ours));
    let reply = protocol::request(network, urn, Command::AuthenticationPhaseOne(terminal), &hello)
        .await?
        .verify(
            kind::PHASE_ONE_REPLY,
            &[
                (field::SOLVED_NONCE, FieldType::Bytes),
                (field::NONCE, FieldType::Bytes),
            ],
        )?;

    // Check its answer before going any further.
    if !nonce::verify_challenge(ours, reply.bytes(field::SOLVED_NONCE)?, key, Challenge::AuthPhaseOne) {
        return Err(Error::new(
            Code::Authentication,
            format!("urn at {urn} failed the phase one challenge"),
        ));
    }

    // Phase two: answer the Urn's challenge.
    let answer = nonce::solve_encrypted(key, reply.bytes(field::NONCE)?, Challenge::AuthPhaseTwo)
        .map_err(|e| Error::new(Code::Authentication, format!("urn nonce: {e}")))?;
    let mut proof = Message::new(kind::PHASE_TWO).with_bytes(field::SOLVED_NONCE, answer);
    for (name, value) in extra {
        proof = proof.with(name, value);
    }
    let welcome = protocol::request(network, urn, Command::AuthenticationPhaseTwo(terminal), &proof)
        .await?
        .verify(kind::PHASE_TWO_REPLY, bootstrap)?;

    info!("Authenticated to the urn at {urn} as {terminal}");
    Ok(welcome)
}
