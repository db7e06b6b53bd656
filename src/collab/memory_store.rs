use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::persistence::{Persistence, ProcedureCode, SessionCode};
use crate::crypto::KeyPair;
use crate::error::{Code, Error, Result};
use crate::model::{EmptyBallot, Person, StationLayout, TerminalKind, BLANK_PREFERENCE};
use crate::vote::WrittenBallot;

/// Operator credentials; `password_hash` is an encoded Argon2 hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operator {
    pub user: String,
    pub password_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSecret {
    pub ip: IpAddr,
    pub kind: TerminalKind,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSeed {
    pub code: SessionCode,
    pub stations: Vec<StationLayout>,
    pub terminals: Vec<TerminalSecret>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcedureSeed {
    pub code: ProcedureCode,
    pub name: String,
    pub ballots: Vec<EmptyBallot>,
    pub voters: Vec<Person>,
    pub sessions: Vec<SessionSeed>,
}

/// Initial contents of a [`MemoryStore`], as read from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSeed {
    #[serde(default)]
    pub operators: Vec<Operator>,
    #[serde(default)]
    pub procedures: Vec<ProcedureSeed>,
}

/// A submission accepted by the Urn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredVote {
    pub procedure: ProcedureCode,
    pub session: SessionCode,
    pub voter: String,
    pub ballots: Vec<WrittenBallot>,
    pub station: IpAddr,
    pub post: IpAddr,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct Records {
    voted: HashSet<(ProcedureCode, String)>,
    votes: Vec<StoredVote>,
    revoked: HashSet<IpAddr>,
}

/// An in-memory [`Persistence`] implementation.
pub struct MemoryStore {
    seed: StoreSeed,
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new(seed: StoreSeed) -> Result<Self> {
        for procedure in &seed.procedures {
            for ballot in &procedure.ballots {
                ballot.validate()?;
            }
        }
        Ok(Self {
            seed,
            records: Default::default(),
        })
    }

    /// Load a JSON [`StoreSeed`] from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::new(Code::Storage, format!("cannot read {}: {e}", path.display()))
        })?;
        let seed: StoreSeed = serde_json::from_str(&json).map_err(|e| {
            Error::new(Code::Storage, format!("invalid store seed {}: {e}", path.display()))
        })?;
        info!(
            "Loaded {} procedure(s) and {} operator(s) from {}",
            seed.procedures.len(),
            seed.operators.len(),
            path.display()
        );
        Self::new(seed)
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn procedure(&self, code: ProcedureCode) -> Result<&ProcedureSeed> {
        self.seed
            .procedures
            .iter()
            .find(|procedure| procedure.code == code)
            .ok_or_else(|| Error::new(Code::Storage, format!("no procedure {code}")))
    }

    fn session(&self, procedure: ProcedureCode, session: SessionCode) -> Result<&SessionSeed> {
        self.procedure(procedure)?
            .sessions
            .iter()
            .find(|candidate| candidate.code == session)
            .ok_or_else(|| {
                Error::new(
                    Code::Storage,
                    format!("no session {session} in procedure {procedure}"),
                )
            })
    }

    /// Stop handing out the secret of the terminal at `ip`.
    pub fn revoke(&self, ip: IpAddr) {
        self.records().revoked.insert(ip);
    }

    pub fn stored_votes(&self) -> Vec<StoredVote> {
        self.records().votes.clone()
    }

    pub fn has_voted(&self, procedure: ProcedureCode, voter: &str) -> bool {
        self.records()
            .voted
            .contains(&(procedure, voter.to_string()))
    }

    /// Count the decrypted choices per ballot code, ignoring blanks.
    pub fn tally(&self, counting_authority: &KeyPair) -> Result<HashMap<(u32, String), usize>> {
        let mut totals = HashMap::new();
        for vote in self.stored_votes() {
            for ballot in &vote.ballots {
                for choice in ballot.decrypt(counting_authority)? {
                    if choice != BLANK_PREFERENCE {
                        *totals.entry((ballot.code(), choice)).or_insert(0) += 1;
                    }
                }
            }
        }
        Ok(totals)
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn check_login_data(&self, user: &str, password: &str) -> Result<bool> {
        let Some(operator) = self.seed.operators.iter().find(|op| op.user == user) else {
            return Ok(false);
        };
        Ok(argon2::verify_encoded(&operator.password_hash, password.as_bytes())?)
    }

    async fn get_terminal_session_key(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        ip: IpAddr,
        kind: TerminalKind,
    ) -> Result<Option<String>> {
        if self.records().revoked.contains(&ip) {
            return Ok(None);
        }
        Ok(self
            .session(procedure, session)?
            .terminals
            .iter()
            .find(|terminal| terminal.ip == ip && terminal.kind == kind)
            .map(|terminal| terminal.secret.clone()))
    }

    async fn get_empty_ballots(&self, procedure: ProcedureCode) -> Result<Vec<EmptyBallot>> {
        Ok(self.procedure(procedure)?.ballots.clone())
    }

    async fn search_person(
        &self,
        procedure: ProcedureCode,
        first_name_like: &str,
        last_name_like: &str,
        max_results: usize,
    ) -> Result<Vec<Person>> {
        let mut found: Vec<Person> = self
            .procedure(procedure)?
            .voters
            .iter()
            .filter(|voter| voter.matches(first_name_like, last_name_like))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            (&a.last_name, &a.first_name, &a.id).cmp(&(&b.last_name, &b.first_name, &b.id))
        });
        found.truncate(max_results);
        Ok(found)
    }

    async fn verify_vote_data(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        voter: &str,
        ballot_codes: &[u32],
    ) -> Result<()> {
        self.session(procedure, session)?;
        let seed = self.procedure(procedure)?;
        let person = seed
            .voters
            .iter()
            .find(|person| person.id == voter)
            .ok_or_else(|| Error::new(Code::UnknownVoter, format!("no voter `{voter}`")))?;
        if self.has_voted(procedure, voter) {
            return Err(Error::new(
                Code::AlreadyVoted,
                format!("voter `{voter}` has already voted"),
            ));
        }
        for code in ballot_codes {
            if !person.ballot_codes.contains(code) {
                return Err(Error::new(
                    Code::Unauthorized,
                    format!("voter `{voter}` may not cast ballot {code}"),
                ));
            }
        }
        Ok(())
    }

    async fn store_votes(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        voter: &str,
        ballots: &[WrittenBallot],
        station: IpAddr,
        post: IpAddr,
    ) -> Result<()> {
        let mut records = self.records();
        if !records.voted.insert((procedure, voter.to_string())) {
            return Err(Error::new(
                Code::AlreadyVoted,
                format!("voter `{voter}` has already voted"),
            ));
        }
        records.votes.push(StoredVote {
            procedure,
            session,
            voter: voter.to_string(),
            ballots: ballots.to_vec(),
            station,
            post,
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn get_terminals_ips(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
    ) -> Result<Vec<StationLayout>> {
        Ok(self.session(procedure, session)?.stations.clone())
    }
}
