use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::auth::responder::{answer_liveness, answer_phase_one, check_phase_two};
use crate::auth::{self, NonceRegistry, Phase};
use crate::collab::{Persistence, Presenter, ProcedureCode, SessionCode};
use crate::crypto::asymmetric::{decode_public_key, encode_public_key, PublicKey};
use crate::crypto::{nonce, Challenge, HmacSigner, SymmetricKey};
use crate::error::{Code, Error, Result};
use crate::model::{EmptyBallot, StateMachine, StationLayout, TerminalKind, UrnState};
use crate::net::{Link, Network};
use crate::protocol::{self, Command, FieldType, Message, Unverified};
use crate::terminal::{field, kind, Terminal, MAX_SEARCH_RESULTS};
use crate::vote::{nonces, WrittenBallot};

/// A terminal that completed both authentication phases.
#[derive(Clone)]
struct Trusted {
    kind: TerminalKind,
    key: SymmetricKey,
    signer: HmacSigner,
    /// A Post's signing key.
    public_key: Option<PublicKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionRef {
    procedure: ProcedureCode,
    session: SessionCode,
}

struct UrnInner {
    state: UrnState,
    session: Option<SessionRef>,
    templates: Vec<EmptyBallot>,
    layouts: Vec<StationLayout>,
    operator: Option<String>,
    trusted: HashMap<IpAddr, Trusted>,
    vote_count: usize,
}

impl UrnInner {
    fn session(&self) -> Result<SessionRef> {
        self.session
            .ok_or_else(|| Error::wrong_state("no voting session selected"))
    }

    fn layout_of(&self, ip: IpAddr) -> Option<(&StationLayout, TerminalKind)> {
        self.layouts
            .iter()
            .find_map(|layout| layout.kind_of(ip).map(|kind| (layout, kind)))
    }

    fn template(&self, code: u32) -> Result<&EmptyBallot> {
        self.templates
            .iter()
            .find(|template| template.code == code)
            .ok_or_else(|| Error::new(Code::UnknownChoice, format!("no ballot with code {code}")))
    }
}

/// The central ballot box: authenticates every other terminal, issues vote
/// nonces and records ballots.
pub struct Urn {
    network: Arc<dyn Network>,
    persistence: Arc<dyn Persistence>,
    counting_key: PublicKey,
    presenter: Arc<dyn Presenter>,
    registry: NonceRegistry,
    inner: Mutex<UrnInner>,
}

impl Urn {
    pub fn new(
        network: Arc<dyn Network>,
        persistence: Arc<dyn Persistence>,
        counting_key: PublicKey,
        presenter: Arc<dyn Presenter>,
    ) -> Self {
        Self {
            network,
            persistence,
            counting_key,
            presenter,
            registry: NonceRegistry::default(),
            inner: Mutex::new(UrnInner {
                state: UrnState::Inactive,
                session: None,
                templates: Vec::new(),
                layouts: Vec::new(),
                operator: None,
                trusted: HashMap::new(),
                vote_count: 0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, UrnInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> UrnState {
        self.inner().state
    }

    /// Ballot submissions accepted since the session was selected.
    pub fn vote_count(&self) -> usize {
        self.inner().vote_count
    }

    pub fn operator(&self) -> Option<String> {
        self.inner().operator.clone()
    }

    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.inner().trusted.contains_key(&ip)
    }

    /// Kinds of the terminals currently authenticated, by IP.
    pub fn trusted_terminals(&self) -> HashMap<IpAddr, TerminalKind> {
        self.inner()
            .trusted
            .iter()
            .map(|(ip, trusted)| (*ip, trusted.kind))
            .collect()
    }

    /// Open a voting session; terminals may then authenticate.
    pub async fn select_session(&self, procedure: ProcedureCode, session: SessionCode) -> Result<()> {
        self.state().expect(&[UrnState::Inactive])?;
        let templates = self.persistence.get_empty_ballots(procedure).await?;
        let layouts = self.persistence.get_terminals_ips(procedure, session).await?;
        for template in &templates {
            template.validate()?;
        }

        let mut inner = self.inner();
        inner.state.transition(UrnState::Active)?;
        inner.session = Some(SessionRef { procedure, session });
        inner.templates = templates;
        inner.layouts = layouts;
        inner.vote_count = 0;
        info!(
            "Session {session} of procedure {procedure} opened with {} station(s)",
            inner.layouts.len()
        );
        drop(inner);
        self.presenter.update();
        Ok(())
    }

    /// Log an operator in.
    pub async fn login(&self, user: &str, password: &str) -> Result<()> {
        self.state().expect(&[UrnState::Active])?;
        if !self.persistence.check_login_data(user, password).await? {
            let err = Error::new(Code::Unauthorized, format!("wrong credentials for `{user}`"));
            self.presenter.print_error(&err);
            return Err(err);
        }
        let mut inner = self.inner();
        inner.state.transition(UrnState::Logging)?;
        inner.operator = Some(user.to_string());
        drop(inner);
        self.presenter.print_success("Login", &format!("welcome, {user}"));
        Ok(())
    }

    pub fn logout(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.state.transition(UrnState::Active)?;
        inner.operator = None;
        Ok(())
    }

    /// Stop trusting the terminal at `ip`. Its next liveness check fails.
    pub fn revoke(&self, ip: IpAddr) {
        if self.inner().trusted.remove(&ip).is_some() {
            info!("Revoked the authentication of {ip}");
        }
        self.registry.forget(ip);
        self.presenter.update();
    }

    /// Close the session, telling every authenticated terminal.
    pub async fn close_session(&self) -> Result<()> {
        let trusted: Vec<IpAddr> = {
            let mut inner = self.inner();
            inner.state.transition(UrnState::Inactive)?;
            inner.session = None;
            inner.operator = None;
            inner.trusted.drain().map(|(ip, _)| ip).collect()
        };
        self.registry.clear();
        self.announce_shutdown(trusted).await;
        self.presenter.update();
        Ok(())
    }

    async fn announce_shutdown(&self, ips: Vec<IpAddr>) {
        let targets: Vec<SocketAddr> = {
            let inner = self.inner();
            ips.iter()
                .filter_map(|&ip| {
                    inner.layouts.iter().find_map(|layout| {
                        std::iter::once(layout.station)
                            .chain(layout.posts.iter().copied())
                            .chain(layout.substations.iter().copied())
                            .find(|addr| addr.ip() == ip)
                    })
                })
                .collect()
        };
        for target in targets {
            let notice = Message::new(kind::NOTICE);
            if let Err(err) =
                protocol::notify(self.network.as_ref(), target, Command::UrnShutdown, &notice).await
            {
                debug!("Could not tell {target} about the shutdown: {err}");
            }
        }
    }

    fn trusted(&self, ip: IpAddr) -> Result<Trusted> {
        self.inner()
            .trusted
            .get(&ip)
            .cloned()
            .ok_or_else(|| Error::new(Code::Unauthorized, format!("{ip} is not authenticated")))
    }

    async fn session_secret(&self, ip: IpAddr, terminal: TerminalKind) -> Result<String> {
        let session = self.inner().session()?;
        self.persistence
            .get_terminal_session_key(session.procedure, session.session, ip, terminal)
            .await?
            .ok_or_else(|| {
                Error::new(
                    Code::Unauthorized,
                    format!("{ip} has no {terminal} key in this session"),
                )
            })
    }

    async fn phase_one(&self, ip: IpAddr, terminal: TerminalKind, request: Message) -> Result<Message> {
        let secret = self.session_secret(ip, terminal).await?;
        answer_phase_one(&SymmetricKey::from_secret(&secret), request, &self.registry, ip)
    }

    async fn phase_two(&self, ip: IpAddr, terminal: TerminalKind, request: Message) -> Result<Message> {
        let secret = self.session_secret(ip, terminal).await?;
        let key = SymmetricKey::from_secret(&secret);
        let mut required = vec![(auth::field::SOLVED_NONCE, FieldType::Bytes)];
        if terminal == TerminalKind::Post {
            required.push((field::PUBLIC_KEY, FieldType::Bytes));
        }
        let request = request.verify(auth::kind::PHASE_TWO, &required)?;
        check_phase_two(&key, &request, &self.registry, ip)?;
        let public_key = match terminal {
            TerminalKind::Post => Some(decode_public_key(request.bytes(field::PUBLIC_KEY)?)?),
            _ => None,
        };

        let welcome = self.bootstrap(ip, terminal)?;
        self.inner().trusted.insert(
            ip,
            Trusted {
                kind: terminal,
                key,
                signer: HmacSigner::new(&secret),
                public_key,
            },
        );
        info!("{terminal} at {ip} authenticated");
        self.presenter.update();
        Ok(welcome)
    }

    /// What a freshly authenticated terminal needs to start working.
    fn bootstrap(&self, ip: IpAddr, terminal: TerminalKind) -> Result<Message> {
        let inner = self.inner();
        let (layout, _) = inner
            .layout_of(ip)
            .filter(|(_, found)| *found == terminal)
            .ok_or_else(|| Error::new(Code::Unauthorized, format!("{ip} is not a {terminal} of this session")))?;
        let welcome = Message::new(auth::kind::PHASE_TWO_REPLY);
        match terminal {
            TerminalKind::Post => welcome
                .with_text(field::STATION, layout.station.to_string())
                .with_bytes(field::COUNTING_KEY, encode_public_key(&self.counting_key)?)
                .with_object(field::BALLOTS, &inner.templates),
            TerminalKind::Station => welcome
                .with_object(field::POSTS, &layout.posts)?
                .with_object(field::SUBSTATIONS, &layout.substations),
            TerminalKind::SubStation => Ok(welcome.with_text(field::STATION, layout.station.to_string())),
            TerminalKind::Urn => Err(Error::new(Code::UnexpectedValue, "an urn cannot authenticate")),
        }
    }

    async fn search(&self, request: Message) -> Result<Message> {
        let request = request.verify(
            kind::SEARCH,
            &[
                (field::FIRST_NAME, FieldType::Text),
                (field::LAST_NAME, FieldType::Text),
            ],
        )?;
        let session = self.inner().session()?;
        let persons = self
            .persistence
            .search_person(
                session.procedure,
                request.text(field::FIRST_NAME)?,
                request.text(field::LAST_NAME)?,
                MAX_SEARCH_RESULTS,
            )
            .await?;
        Message::new(kind::SEARCH_RESULT).with_object(field::PERSONS, &persons)
    }

    /// Issue one nonce per expressible preference of each requested ballot.
    async fn issue_nonces(&self, ip: IpAddr, request: Message) -> Result<Message> {
        let request = request.verify(
            kind::BALLOTS_REQUEST,
            &[
                (field::VOTER, FieldType::Text),
                (field::BALLOT_CODES, FieldType::Object),
            ],
        )?;
        let voter = request.text(field::VOTER)?;
        let codes: Vec<u32> = request.object(field::BALLOT_CODES)?;
        let trusted = self.trusted(ip)?;
        let session = self.inner().session()?;
        self.persistence
            .verify_vote_data(session.procedure, session.session, voter, &codes)
            .await?;

        let preferences = {
            let inner = self.inner();
            codes
                .iter()
                .map(|&code| inner.template(code).map(|template| template.max_preferences))
                .collect::<Result<Vec<_>>>()?
        };
        let batch = nonce::generate_batch(&preferences);
        self.registry
            .issue(Phase::Vote, ip, batch.iter().flatten().copied().collect());
        debug!("Issued vote nonces for {} ballot(s) of {voter} to {ip}", codes.len());
        Ok(Message::new(kind::VOTE_NONCES).with(field::NONCES, nonces::seal(&trusted.key, &batch)))
    }

    /// Verify a submission from the Post at `ip` and record it.
    async fn accept_vote(&self, ip: IpAddr, request: Message) -> Result<()> {
        // Pending nonces are spent whatever the outcome.
        let mut unused = self.registry.consume(Phase::Vote, ip)?;
        let request = request.verify(
            kind::VOTE,
            &[(field::VOTER, FieldType::Text), (field::BALLOTS, FieldType::Object)],
        )?;
        let voter = request.text(field::VOTER)?;
        let ballots: Vec<WrittenBallot> = request.object(field::BALLOTS)?;
        let trusted = self.trusted(ip)?;
        let booth = trusted
            .public_key
            .as_ref()
            .ok_or_else(|| Error::new(Code::Invariant, format!("no signing key for post {ip}")))?;

        // Every preference must be well formed and signed by this Post.
        {
            let inner = self.inner();
            for ballot in &ballots {
                let template = inner.template(ballot.code())?;
                if ballot.max_preferences() != template.max_preferences {
                    return Err(Error::malformed(format!(
                        "ballot {} claims {} preferences, template has {}",
                        ballot.code(),
                        ballot.max_preferences(),
                        template.max_preferences
                    )));
                }
                ballot.verify(&trusted.signer, booth)?;
            }
        }

        // Each preference spends a distinct issued nonce.
        for solved in ballots.iter().flat_map(|ballot| ballot.solved_nonces()) {
            let position = unused
                .iter()
                .position(|&issued| nonce::verify_challenge(issued, solved, &trusted.key, Challenge::Vote))
                .ok_or_else(|| {
                    Error::new(
                        Code::Authentication,
                        format!("a preference from {ip} is not bound to an issued nonce"),
                    )
                })?;
            unused.swap_remove(position);
        }
        if !unused.is_empty() {
            return Err(Error::malformed(format!(
                "{} issued nonce(s) left unanswered by {ip}",
                unused.len()
            )));
        }

        let codes: Vec<u32> = ballots.iter().map(WrittenBallot::code).collect();
        let (session, station) = {
            let inner = self.inner();
            let station = inner
                .layout_of(ip)
                .map(|(layout, _)| layout.station.ip())
                .ok_or_else(|| Error::new(Code::Unauthorized, format!("{ip} is not in this session")))?;
            (inner.session()?, station)
        };
        self.persistence
            .verify_vote_data(session.procedure, session.session, voter, &codes)
            .await?;
        self.persistence
            .store_votes(session.procedure, session.session, voter, &ballots, station, ip)
            .await?;

        let count = {
            let mut inner = self.inner();
            inner.vote_count += 1;
            inner.vote_count
        };
        info!("Recorded the ballots of {voter} from post {ip} ({count} so far)");
        self.presenter.update();
        Ok(())
    }

    fn liveness(&self, ip: IpAddr, request: Message<Unverified>) -> Result<Message> {
        answer_liveness(&self.trusted(ip)?.key, request)
    }
}

/// Commands each authenticated kind may send to the Urn.
fn allowed(terminal: TerminalKind, command: Command) -> bool {
    match command {
        Command::CheckAuthentication => true,
        Command::SearchPerson => matches!(terminal, TerminalKind::Station | TerminalKind::SubStation),
        Command::Ballots | Command::SendVote => terminal == TerminalKind::Post,
        _ => false,
    }
}

#[async_trait]
impl Terminal for Urn {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Urn
    }

    fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool {
        let inner = self.inner();
        if !inner.state.is_open() {
            return false;
        }
        match command {
            Command::AuthenticationPhaseOne(terminal) | Command::AuthenticationPhaseTwo(terminal) => {
                inner.layout_of(peer).map(|(_, kind)| kind) == Some(terminal)
            }
            _ => inner
                .trusted
                .get(&peer)
                .map(|trusted| allowed(trusted.kind, command))
                .unwrap_or(false),
        }
    }

    async fn handle(&self, command: Command, link: &mut Link) -> Result<()> {
        let ip = link.peer().ip();
        let request = link.receive().await?;
        let reply = match command {
            Command::AuthenticationPhaseOne(terminal) => self.phase_one(ip, terminal, request).await?,
            Command::AuthenticationPhaseTwo(terminal) => self.phase_two(ip, terminal, request).await?,
            Command::CheckAuthentication => self.liveness(ip, request)?,
            Command::SearchPerson => self.search(request).await?,
            Command::Ballots => self.issue_nonces(ip, request).await?,
            Command::SendVote => {
                self.accept_vote(ip, request).await?;
                Message::ack()
            }
            _ => return Err(Error::new(Code::UnknownCommand, format!("urn cannot handle {command}"))),
        };
        link.send(&reply).await
    }

    async fn after_close(&self) {
        if self.state() == UrnState::Inactive {
            return;
        }
        if let Err(err) = self.close_session().await {
            warn!("Could not close the session cleanly: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collab::memory_store::examples::*;
    use crate::collab::{LogPresenter, MemoryStore, StoreSeed};
    use crate::crypto::asymmetric::examples::counting_authority;
    use crate::net::SimulatedNetwork;

    fn urn() -> Urn {
        let network = SimulatedNetwork::new(Duration::from_millis(200));
        Urn::new(
            Arc::new(network.host(URN.parse::<SocketAddr>().unwrap().ip())),
            Arc::new(MemoryStore::new(StoreSeed::example()).unwrap()),
            counting_authority().public().clone(),
            Arc::new(LogPresenter),
        )
    }

    fn ip(addr: &str) -> IpAddr {
        addr.parse::<SocketAddr>().unwrap().ip()
    }

    #[tokio::test]
    async fn session_then_login() {
        let urn = urn();
        assert_eq!(
            urn.login(OPERATOR, OPERATOR_PASSWORD).await.unwrap_err().code(),
            Code::WrongState
        );

        urn.select_session(PROCEDURE, SESSION).await.unwrap();
        assert_eq!(urn.state(), UrnState::Active);
        assert_eq!(
            urn.select_session(PROCEDURE, SESSION).await.unwrap_err().code(),
            Code::WrongState
        );

        assert_eq!(
            urn.login(OPERATOR, "guess").await.unwrap_err().code(),
            Code::Unauthorized
        );
        assert_eq!(urn.state(), UrnState::Active);
        urn.login(OPERATOR, OPERATOR_PASSWORD).await.unwrap();
        assert_eq!(urn.state(), UrnState::Logging);
        assert_eq!(urn.operator().as_deref(), Some(OPERATOR));

        urn.logout().unwrap();
        assert_eq!(urn.state(), UrnState::Active);
    }

    #[tokio::test]
    async fn unknown_session_stays_inactive() {
        let urn = urn();
        assert!(urn.select_session(PROCEDURE, 42).await.is_err());
        assert_eq!(urn.state(), UrnState::Inactive);
    }

    #[tokio::test]
    async fn peers_are_checked_against_the_layout() {
        let urn = urn();
        let post = ip(POSTS[0]);
        let phase_one = Command::AuthenticationPhaseOne(TerminalKind::Post);
        // Closed urn.
        assert!(!urn.verify_peer_ip(phase_one, post));

        urn.select_session(PROCEDURE, SESSION).await.unwrap();
        assert!(urn.verify_peer_ip(phase_one, post));
        assert!(!urn.verify_peer_ip(Command::AuthenticationPhaseOne(TerminalKind::Station), post));
        assert!(!urn.verify_peer_ip(phase_one, "10.9.9.9".parse().unwrap()));
        // Not authenticated yet.
        assert!(!urn.verify_peer_ip(Command::Ballots, post));
        assert!(!urn.verify_peer_ip(Command::CheckAuthentication, post));
    }

    #[test]
    fn commands_per_kind() {
        assert!(allowed(TerminalKind::Post, Command::SendVote));
        assert!(!allowed(TerminalKind::Station, Command::SendVote));
        assert!(allowed(TerminalKind::SubStation, Command::SearchPerson));
        assert!(!allowed(TerminalKind::Post, Command::SearchPerson));
        assert!(allowed(TerminalKind::Station, Command::CheckAuthentication));
        assert!(!allowed(TerminalKind::Post, Command::Association));
    }

    #[tokio::test]
    async fn bootstrap_per_kind() {
        let urn = urn();
        urn.select_session(PROCEDURE, SESSION).await.unwrap();

        let welcome = urn
            .bootstrap(ip(POSTS[1]), TerminalKind::Post)
            .unwrap()
            .verify(auth::kind::PHASE_TWO_REPLY, &[])
            .unwrap();
        assert_eq!(welcome.text(field::STATION).unwrap(), STATION);
        let ballots: Vec<EmptyBallot> = welcome.object(field::BALLOTS).unwrap();
        assert_eq!(ballots, EmptyBallot::all_examples());

        let welcome = urn
            .bootstrap(ip(STATION), TerminalKind::Station)
            .unwrap()
            .verify(auth::kind::PHASE_TWO_REPLY, &[])
            .unwrap();
        let posts: Vec<SocketAddr> = welcome.object(field::POSTS).unwrap();
        assert_eq!(posts.len(), 2);

        assert!(urn.bootstrap(ip(STATION), TerminalKind::Post).is_err());
    }
}
