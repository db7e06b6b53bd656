use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use crate::auth::{field, kind};
use crate::crypto::{nonce, Challenge, SymmetricKey};
use crate::error::{Code, Error, Result};
use crate::protocol::{FieldType, Message, Unverified, Verified};

/// What a pending challenge will be answered with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    AuthenticationTwo,
    Vote,
}

/// Pending nonces issued by this terminal, per phase and per peer IP.
///
/// Each entry is consumed exactly once, by the first matching response.
#[derive(Debug, Default)]
pub struct NonceRegistry {
    pending: Mutex<HashMap<(Phase, IpAddr), Vec<i64>>>,
}

impl NonceRegistry {
    fn pending(&self) -> MutexGuard<'_, HashMap<(Phase, IpAddr), Vec<i64>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record nonces for `ip`, replacing any it had not answered yet.
    pub fn issue(&self, phase: Phase, ip: IpAddr, nonces: Vec<i64>) {
        if self.pending().insert((phase, ip), nonces).is_some() {
            debug!("Replaced unanswered {phase:?} challenge for {ip}");
        }
    }

    /// Take the nonces pending for `ip`.
    pub fn consume(&self, phase: Phase, ip: IpAddr) -> Result<Vec<i64>> {
        self.pending().remove(&(phase, ip)).ok_or_else(|| {
            Error::new(
                Code::NoPendingChallenge,
                format!("no pending {phase:?} challenge for {ip}"),
            )
        })
    }

    pub fn is_pending(&self, phase: Phase, ip: IpAddr) -> bool {
        self.pending().contains_key(&(phase, ip))
    }

    /// Forget everything pending for `ip`.
    pub fn forget(&self, ip: IpAddr) {
        self.pending().retain(|(_, pending_ip), _| *pending_ip != ip);
    }

    pub fn clear(&self) {
        self.pending().clear();
    }
}

/// Answer the initiator's first nonce and challenge it with our own.
pub fn answer_phase_one(
    key: &SymmetricKey,
    request: Message<Unverified>,
    registry: &NonceRegistry,
    ip: IpAddr,
) -> Result<Message> {
    let request = request.verify(kind::PHASE_ONE, &[(field::NONCE, FieldType::Bytes)])?;
    let solved = nonce::solve_encrypted(key, request.bytes(field::NONCE)?, Challenge::AuthPhaseOne)
        .map_err(|e| Error::new(Code::Authentication, format!("phase one from {ip}: {e}")))?;

    let challenge = nonce::generate();
    registry.issue(Phase::AuthenticationTwo, ip, vec![challenge]);
    Ok(Message::new(kind::PHASE_ONE_REPLY)
        .with_bytes(field::SOLVED_NONCE, solved)
        .with_bytes(field::NONCE, nonce::encrypt(key, challenge)))
}

/// Check the initiator's answer to our challenge, consuming it.
pub fn check_phase_two(
    key: &SymmetricKey,
    request: &Message<Verified>,
    registry: &NonceRegistry,
    ip: IpAddr,
) -> Result<()> {
    let pending = registry.consume(Phase::AuthenticationTwo, ip)?;
    let response = request.bytes(field::SOLVED_NONCE)?;
    let solved = pending
        .iter()
        .any(|&challenge| nonce::verify_challenge(challenge, response, key, Challenge::AuthPhaseTwo));
    if !solved {
        return Err(Error::new(
            Code::Authentication,
            format!("{ip} failed the phase two challenge"),
        ));
    }
    Ok(())
}

/// Answer a liveness check from an authenticated terminal.
pub fn answer_liveness(key: &SymmetricKey, request: Message<Unverified>) -> Result<Message> {
    let request = request.verify(kind::LIVENESS, &[(field::NONCE, FieldType::Bytes)])?;
    let solved = nonce::solve_encrypted(key, request.bytes(field::NONCE)?, Challenge::AuthPhaseOne)
        .map_err(|e| Error::new(Code::Authentication, e.to_string()))?;
    Ok(Message::new(kind::LIVENESS_REPLY).with_bytes(field::SOLVED_NONCE, solved))
}
