use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{EmptyBallot, Person, StationLayout, TerminalKind};
use crate::vote::WrittenBallot;

/// Identifies an election definition.
pub type ProcedureCode = u32;
/// Identifies one voting window of a procedure.
pub type SessionCode = u32;

/// The storage collaborator consulted by the Urn.
///
/// Implementations own voter registration, operator credentials and the
/// recorded ballots; the terminals only move data in and out.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    async fn check_login_data(&self, user: &str, password: &str) -> Result<bool>;

    /// The pre-shared secret of the terminal at `ip`, if it belongs to the session.
    async fn get_terminal_session_key(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        ip: IpAddr,
        kind: TerminalKind,
    ) -> Result<Option<String>>;

    async fn get_empty_ballots(&self, procedure: ProcedureCode) -> Result<Vec<EmptyBallot>>;

    async fn search_person(
        &self,
        procedure: ProcedureCode,
        first_name_like: &str,
        last_name_like: &str,
        max_results: usize,
    ) -> Result<Vec<Person>>;

    /// Fail unless `voter` may still cast `ballot_codes` in this session.
    async fn verify_vote_data(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        voter: &str,
        ballot_codes: &[u32],
    ) -> Result<()>;

    async fn store_votes(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
        voter: &str,
        ballots: &[WrittenBallot],
        station: IpAddr,
        post: IpAddr,
    ) -> Result<()>;

    /// Every Station of the session, with its Posts and SubStations.
    async fn get_terminals_ips(
        &self,
        procedure: ProcedureCode,
        session: SessionCode,
    ) -> Result<Vec<StationLayout>>;
}
