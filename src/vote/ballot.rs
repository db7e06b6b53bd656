use serde::{Deserialize, Serialize};

use crate::crypto::asymmetric::PublicKey;
use crate::crypto::{nonce, Challenge, HmacSigner, KeyPair};
use crate::error::{Code, Error, Result};
use crate::model::encoding::base64_bytes;
use crate::model::{EmptyBallot, BLANK_PREFERENCE};
use crate::vote::{VotePacket, VotingSession};

/// One expressible preference of a written ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Preference {
    Plain {
        choice: String,
    },
    #[serde(rename_all = "camelCase")]
    Encrypted {
        packet: VotePacket,
        /// The Urn's nonce for this preference, solved and encrypted under the session key.
        #[serde(with = "base64_bytes")]
        solved_nonce: Vec<u8>,
    },
}

/// A voter's copy of one ballot: plaintext choices while voting, packets once encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrittenBallot {
    code: u32,
    max_preferences: usize,
    preferences: Vec<Preference>,
}

impl WrittenBallot {
    pub fn new(template: &EmptyBallot) -> Self {
        Self {
            code: template.code,
            max_preferences: template.max_preferences,
            preferences: Vec::new(),
        }
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn max_preferences(&self) -> usize {
        self.max_preferences
    }

    pub fn preferences(&self) -> &[Preference] {
        &self.preferences
    }

    pub fn is_encrypted(&self) -> bool {
        self.preferences
            .iter()
            .any(|preference| matches!(preference, Preference::Encrypted { .. }))
    }

    /// The plaintext choices made so far.
    pub fn choices(&self) -> Vec<&str> {
        self.preferences
            .iter()
            .filter_map(|preference| match preference {
                Preference::Plain { choice } => Some(choice.as_str()),
                Preference::Encrypted { .. } => None,
            })
            .collect()
    }

    /// Add a choice, checking it against the ballot's template.
    pub fn select(&mut self, template: &EmptyBallot, choice: &str) -> Result<()> {
        if template.code != self.code {
            return Err(Error::new(
                Code::Invariant,
                format!("template {} used for ballot {}", template.code, self.code),
            ));
        }
        if self.is_encrypted() {
            return Err(Error::wrong_state(format!("ballot {} is already encrypted", self.code)));
        }
        if self.preferences.len() >= self.max_preferences {
            return Err(Error::new(
                Code::MaxPreferences,
                format!("ballot {} allows at most {} preferences", self.code, self.max_preferences),
            ));
        }
        if !template.is_valid_choice(choice) {
            return Err(Error::new(
                Code::UnknownChoice,
                format!("`{choice}` is not a choice on ballot {}", self.code),
            ));
        }
        if self.choices().contains(&choice) {
            return Err(Error::new(
                Code::DuplicateChoice,
                format!("`{choice}` is already selected on ballot {}", self.code),
            ));
        }
        self.preferences.push(Preference::Plain {
            choice: choice.to_string(),
        });
        Ok(())
    }

    /// Remove a previously selected choice. Returns whether it was selected.
    pub fn deselect(&mut self, choice: &str) -> bool {
        let before = self.preferences.len();
        self.preferences
            .retain(|preference| !matches!(preference, Preference::Plain { choice: c } if c == choice));
        self.preferences.len() != before
    }

    /// Encrypt every expressible preference, padding with blanks, binding each to one of `nonces`.
    pub fn encrypt(&self, nonces: &[i64], session: &VotingSession) -> Result<WrittenBallot> {
        if self.is_encrypted() {
            return Err(Error::wrong_state(format!("ballot {} is already encrypted", self.code)));
        }
        if nonces.len() != self.max_preferences {
            return Err(Error::new(
                Code::NoPendingChallenge,
                format!(
                    "ballot {} needs {} nonces, got {}",
                    self.code,
                    self.max_preferences,
                    nonces.len()
                ),
            ));
        }

        let choices = self.choices();
        let padded = choices
            .iter()
            .copied()
            .chain(std::iter::repeat(BLANK_PREFERENCE))
            .take(self.max_preferences);

        let preferences = padded
            .zip(nonces)
            .map(|(choice, &issued)| -> Result<Preference> {
                let solved_nonce = nonce::encrypt(&session.session_key, Challenge::Vote.solve(issued));
                let mut packet = VotePacket::encrypt(choice, &session.counting_key)?;
                packet.sign_hmac(&session.signer, &solved_nonce)?;
                packet.sign(&session.booth)?;
                Ok(Preference::Encrypted {
                    packet,
                    solved_nonce,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WrittenBallot {
            code: self.code,
            max_preferences: self.max_preferences,
            preferences,
        })
    }

    /// Check the shape, HMAC and signature of every encrypted preference.
    pub fn verify(&self, signer: &HmacSigner, booth: &PublicKey) -> Result<()> {
        if self.preferences.len() != self.max_preferences {
            return Err(Error::malformed(format!(
                "ballot {} carries {} preferences, expected {}",
                self.code,
                self.preferences.len(),
                self.max_preferences
            )));
        }
        for preference in &self.preferences {
            match preference {
                Preference::Encrypted {
                    packet,
                    solved_nonce,
                } => packet.verify(signer, solved_nonce, booth)?,
                Preference::Plain { .. } => {
                    return Err(Error::malformed(format!(
                        "ballot {} contains a plaintext preference",
                        self.code
                    )))
                }
            }
        }
        Ok(())
    }

    /// The solved nonces, in preference order.
    pub fn solved_nonces(&self) -> impl Iterator<Item = &[u8]> {
        self.preferences.iter().filter_map(|preference| match preference {
            Preference::Encrypted { solved_nonce, .. } => Some(solved_nonce.as_slice()),
            Preference::Plain { .. } => None,
        })
    }

    /// Recover the plaintext choices, blanks included.
    pub fn decrypt(&self, counting_authority: &KeyPair) -> Result<Vec<String>> {
        self.preferences
            .iter()
            .map(|preference| match preference {
                Preference::Encrypted { packet, .. } => packet.decrypt(counting_authority),
                Preference::Plain { choice } => Ok(choice.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::asymmetric::examples::{booth, counting_authority};
    use crate::vote::session::examples::session;

    #[test]
    fn selection_rules() {
        let template = EmptyBallot::example();
        let mut ballot = WrittenBallot::new(&template);
        ballot.select(&template, "c1").unwrap();

        let err = ballot.select(&template, "c1").unwrap_err();
        assert_eq!(err.code(), Code::DuplicateChoice);
        let err = ballot.select(&template, "m1").unwrap_err();
        assert_eq!(err.code(), Code::UnknownChoice);

        ballot.select(&template, "c3").unwrap();
        let err = ballot.select(&template, "c2").unwrap_err();
        assert_eq!(err.code(), Code::MaxPreferences);
        assert_eq!(ballot.choices(), ["c1", "c3"]);

        assert!(ballot.deselect("c1"));
        assert!(!ballot.deselect("c1"));
        ballot.select(&template, "c2").unwrap();
        assert_eq!(ballot.choices(), ["c3", "c2"]);

        let mayor = EmptyBallot::example_mayor();
        assert!(ballot.select(&mayor, "m1").is_err());
    }

    #[test]
    fn encrypt_pads_and_decrypts() {
        let template = EmptyBallot::example();
        let mut ballot = WrittenBallot::new(&template);
        ballot.select(&template, "c2").unwrap();

        let session = session();
        let nonces = [5_000, 6_000];
        let encrypted = ballot.encrypt(&nonces, &session).unwrap();
        assert!(encrypted.is_encrypted());
        assert_eq!(encrypted.preferences().len(), 2);
        encrypted.verify(&session.signer, booth(0).public()).unwrap();
        assert_eq!(
            encrypted.decrypt(counting_authority()).unwrap(),
            ["c2", BLANK_PREFERENCE]
        );

        let solved: Vec<i64> = encrypted
            .solved_nonces()
            .map(|solved| nonce::decrypt(&session.session_key, solved).unwrap())
            .collect();
        assert_eq!(solved, [5_030, 6_030]);

        // Frozen once encrypted.
        let mut frozen = encrypted.clone();
        assert!(frozen.select(&template, "c1").is_err());
        assert!(encrypted.encrypt(&nonces, &session).is_err());
    }

    #[test]
    fn encrypt_needs_one_nonce_per_preference() {
        let template = EmptyBallot::example();
        let ballot = WrittenBallot::new(&template);
        let err = ballot.encrypt(&[1_000], &session()).unwrap_err();
        assert_eq!(err.code(), Code::NoPendingChallenge);
    }

    #[test]
    fn verify_rejects_tampering_and_wrong_shape() {
        let template = EmptyBallot::example_referendum();
        let mut ballot = WrittenBallot::new(&template);
        ballot.select(&template, "yes").unwrap();
        assert!(ballot.verify(&session().signer, booth(0).public()).is_err());

        let session = session();
        let encrypted = ballot.encrypt(&[7_777], &session).unwrap();
        encrypted.verify(&session.signer, booth(0).public()).unwrap();
        assert!(encrypted.verify(&session.signer, booth(2).public()).is_err());

        let mut swapped = encrypted.clone();
        if let Preference::Encrypted { solved_nonce, .. } = &mut swapped.preferences[0] {
            *solved_nonce = nonce::encrypt(&session.session_key, 9_999);
        }
        let err = swapped.verify(&session.signer, booth(0).public()).unwrap_err();
        assert_eq!(err.code(), Code::Hmac);

        let mut short = encrypted;
        short.preferences.clear();
        assert!(short.verify(&session.signer, booth(0).public()).is_err());
    }
}
