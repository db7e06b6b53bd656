use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::auth::{self, keep_alive, KeepAlive, UrnContact};
use crate::collab::{CardOutcome, Presenter};
use crate::crypto::asymmetric::{decode_public_key, encode_public_key};
use crate::crypto::KeyPair;
use crate::error::{Code, Error, Result};
use crate::model::{EmptyBallot, Person, PostState, StateMachine, TerminalKind, UNASSIGNED_BADGE};
use crate::net::Link;
use crate::protocol::{self, Command, FieldType, Message, Value};
use crate::terminal::{field, kind, Terminal};
use crate::vote::{nonces, VotingSession, WrittenBallot};

/// Everything the Post knows about the voter in front of it.
struct PostInner {
    state: PostState,
    station: Option<SocketAddr>,
    session: Option<VotingSession>,
    templates: Vec<EmptyBallot>,
    badge: String,
    voter: Option<Person>,
    ballots: Vec<WrittenBallot>,
    /// Vote nonces issued by the Urn, by ballot code.
    nonces: HashMap<u32, Vec<i64>>,
    /// Ballots are on their way to the Urn.
    sending: bool,
}

impl PostInner {
    fn clear_voter(&mut self) {
        self.badge = UNASSIGNED_BADGE.to_string();
        self.voter = None;
        self.ballots.clear();
        self.nonces.clear();
    }

    fn state_message(&self) -> Message {
        Message::new(kind::POST_STATE)
            .with(field::STATE, Value::Text(state_name(self.state)))
            .with_text(field::BADGE, self.badge.clone())
    }

    fn expect_editable(&self) -> Result<()> {
        self.state.expect(&[PostState::InUse])?;
        if self.sending {
            return Err(Error::wrong_state("ballots are being sent to the urn"));
        }
        Ok(())
    }

    fn template(&self, code: u32) -> Result<&EmptyBallot> {
        self.templates
            .iter()
            .find(|template| template.code == code)
            .ok_or_else(|| Error::new(Code::UnknownChoice, format!("no ballot with code {code}")))
    }
}

pub(crate) fn state_name(state: PostState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{state:?}"))
}

pub(crate) fn parse_state(name: &str) -> Result<PostState> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| Error::new(Code::UnexpectedValue, format!("unknown post state `{name}`")))
}

/// The voting booth.
pub struct Post {
    contact: UrnContact,
    booth: KeyPair,
    presenter: Arc<dyn Presenter>,
    inner: Mutex<PostInner>,
}

impl Post {
    pub fn new(contact: UrnContact, booth: KeyPair, presenter: Arc<dyn Presenter>) -> Self {
        Self {
            contact,
            booth,
            presenter,
            inner: Mutex::new(PostInner {
                state: PostState::Inactive,
                station: None,
                session: None,
                templates: Vec::new(),
                badge: UNASSIGNED_BADGE.to_string(),
                voter: None,
                ballots: Vec::new(),
                nonces: HashMap::new(),
                sending: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, PostInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> PostState {
        self.inner().state
    }

    pub fn badge(&self) -> String {
        self.inner().badge.clone()
    }

    pub fn voter(&self) -> Option<Person> {
        self.inner().voter.clone()
    }

    pub fn station(&self) -> Option<SocketAddr> {
        self.inner().station
    }

    /// The voter's ballots as currently filled in.
    pub fn ballots(&self) -> Vec<WrittenBallot> {
        self.inner().ballots.clone()
    }

    pub fn templates(&self) -> Vec<EmptyBallot> {
        self.inner().templates.clone()
    }

    /// Add `choice` to the voter's ballot `code`.
    pub fn select(&self, code: u32, choice: &str) -> Result<()> {
        let mut inner = self.inner();
        inner.expect_editable()?;
        let template = inner.template(code)?.clone();
        let ballot = inner
            .ballots
            .iter_mut()
            .find(|ballot| ballot.code() == code)
            .ok_or_else(|| Error::new(Code::Unauthorized, format!("voter may not cast ballot {code}")))?;
        ballot.select(&template, choice)?;
        drop(inner);
        self.presenter.update();
        Ok(())
    }

    pub fn deselect(&self, code: u32, choice: &str) -> Result<bool> {
        let mut inner = self.inner();
        inner.expect_editable()?;
        let removed = inner
            .ballots
            .iter_mut()
            .find(|ballot| ballot.code() == code)
            .map(|ballot| ballot.deselect(choice))
            .unwrap_or(false);
        drop(inner);
        self.presenter.update();
        Ok(removed)
    }

    /// Encrypt and sign the voter's ballots and submit them to the Urn.
    pub async fn send_vote(&self) -> Result<()> {
        let result = self.try_send_vote().await;
        match &result {
            Ok(()) => self.presenter.print_success("Vote", "ballots sent to the urn"),
            Err(err) => self.presenter.print_error(err),
        }
        result
    }

    async fn try_send_vote(&self) -> Result<()> {
        // Snapshot what is needed; encryption happens without the lock.
        let (voter, ballots, nonces, session) = {
            let mut inner = self.inner();
            inner.expect_editable()?;
            let voter = inner
                .voter
                .as_ref()
                .map(|voter| voter.id.clone())
                .ok_or_else(|| Error::new(Code::Invariant, "post in use without a voter"))?;
            let session = inner
                .session
                .clone()
                .ok_or_else(|| Error::new(Code::Invariant, "post in use without a voting session"))?;
            inner.sending = true;
            (voter, inner.ballots.clone(), inner.nonces.clone(), session)
        };

        let submitted = self.submit(&voter, &ballots, &nonces, &session).await;
        let moved = {
            let mut inner = self.inner();
            inner.sending = false;
            submitted?;
            info!("Ballots of voter {voter} accepted by the urn");

            // The vote is stored whatever happened to the Post meanwhile.
            let same_voter = inner.voter.as_ref().map(|v| v.id.as_str()) == Some(voter.as_str());
            if inner.state == PostState::InUse && same_voter {
                inner.state.transition(PostState::VoteSent)?;
                inner.ballots.clear();
                inner.nonces.clear();
                None
            } else {
                Some(inner.state)
            }
        };
        match moved {
            None => self.notify_station().await,
            Some(state) => warn!("Post moved to {state:?} while the ballots of voter {voter} were being sent"),
        }
        self.presenter.update();
        Ok(())
    }

    /// Encrypt every ballot with the nonces the Urn issued for it, and send them.
    async fn submit(
        &self,
        voter: &str,
        ballots: &[WrittenBallot],
        nonces: &HashMap<u32, Vec<i64>>,
        session: &VotingSession,
    ) -> Result<()> {
        let encrypted = ballots
            .iter()
            .map(|ballot| {
                let issued = nonces.get(&ballot.code()).ok_or_else(|| {
                    Error::new(
                        Code::NoPendingChallenge,
                        format!("no nonces for ballot {}", ballot.code()),
                    )
                })?;
                ballot.encrypt(issued, session)
            })
            .collect::<Result<Vec<_>>>()?;

        let vote = Message::new(kind::VOTE)
            .with_text(field::VOTER, voter)
            .with_object(field::BALLOTS, &encrypted)?;
        protocol::notify(self.contact.network.as_ref(), self.contact.urn, Command::SendVote, &vote).await
    }

    /// Start the voter's session: fetch nonces from the Urn and open the ballots.
    async fn start_voting(&self, badge: &str) -> Result<()> {
        let (voter, codes) = {
            let inner = self.inner();
            inner.state.expect(&[PostState::Associated])?;
            if inner.badge != badge {
                return Err(Error::new(
                    Code::BadgeInUse,
                    format!("badge {badge} is not the one assigned to this post"),
                ));
            }
            let voter = inner
                .voter
                .clone()
                .ok_or_else(|| Error::new(Code::Invariant, "post associated without a voter"))?;
            let codes = voter.ballot_codes.clone();
            (voter, codes)
        };

        let request = Message::new(kind::BALLOTS_REQUEST)
            .with_text(field::VOTER, voter.id.clone())
            .with_object(field::BALLOT_CODES, &codes)?;
        let reply = protocol::request(self.contact.network.as_ref(), self.contact.urn, Command::Ballots, &request)
            .await?
            .verify(kind::VOTE_NONCES, &[(field::NONCES, FieldType::List)])?;
        let batch = nonces::open(self.contact.key(), reply.list(field::NONCES)?)?;
        if batch.len() != codes.len() {
            return Err(Error::malformed(format!(
                "urn issued nonces for {} ballots, expected {}",
                batch.len(),
                codes.len()
            )));
        }

        {
            let mut inner = self.inner();
            // The Station may have released the Post meanwhile.
            if inner.state != PostState::Associated || inner.badge != badge {
                return Err(Error::wrong_state("post was released while fetching ballots"));
            }
            let ballots = codes
                .iter()
                .map(|&code| inner.template(code).map(WrittenBallot::new))
                .collect::<Result<Vec<_>>>()?;
            inner.state.transition(PostState::InUse)?;
            inner.ballots = ballots;
            inner.nonces = codes.iter().copied().zip(batch).collect();
        }
        self.notify_station().await;
        self.presenter.update();
        Ok(())
    }

    /// Push our state to the Station. Failure only gets logged.
    async fn notify_station(&self) {
        let (station, message) = {
            let inner = self.inner();
            match inner.station {
                Some(station) => (station, inner.state_message()),
                None => return,
            }
        };
        if let Err(err) =
            protocol::notify(self.contact.network.as_ref(), station, Command::PostStateNotify, &message).await
        {
            warn!("Could not notify the station at {station}: {err}");
        }
    }

    fn associate(&self, request: Message) -> Result<Message> {
        let request = request.verify(
            kind::ASSOCIATION,
            &[(field::BADGE, FieldType::Text), (field::VOTER, FieldType::Object)],
        )?;
        let badge = request.text(field::BADGE)?;
        let voter: Person = request.object(field::VOTER)?;
        if badge.is_empty() || badge == UNASSIGNED_BADGE {
            return Err(Error::new(Code::UnexpectedValue, format!("`{badge}` is not a badge")));
        }

        let mut inner = self.inner();
        inner.state.expect(&[PostState::Active])?;
        for &code in &voter.ballot_codes {
            inner.template(code)?;
        }
        inner.state.transition(PostState::Associated)?;
        inner.badge = badge.to_string();
        info!("Voter {} associated with badge {badge}", voter.id);
        inner.voter = Some(voter);
        Ok(inner.state_message())
    }

    fn release(&self, request: Message) -> Result<Message> {
        let request = request.verify(kind::RELEASE, &[(field::BADGE, FieldType::Text)])?;
        let badge = request.text(field::BADGE)?;

        let mut inner = self.inner();
        inner.state.expect(&[PostState::Associated, PostState::VoteSent])?;
        if inner.badge != badge {
            return Err(Error::new(
                Code::BadgeInUse,
                format!("badge {badge} is not assigned to this post"),
            ));
        }
        inner.state.transition(PostState::Active)?;
        inner.clear_voter();
        Ok(inner.state_message())
    }

    /// Forget the voter and go back to `Active`. Only an authenticated Post
    /// with no ballots in flight can be reset.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner();
        inner.state.expect(&[
            PostState::Active,
            PostState::Associated,
            PostState::InUse,
            PostState::VoteSent,
            PostState::ToReset,
        ])?;
        if inner.sending {
            return Err(Error::wrong_state("cannot reset while ballots are being sent"));
        }
        if inner.state != PostState::ToReset {
            inner.state.transition(PostState::ToReset)?;
        }
        inner.clear_voter();
        inner.state.transition(PostState::Active)?;
        drop(inner);
        self.presenter.update();
        Ok(())
    }

    /// Drop back to `Inactive`, forgetting the voter.
    fn deactivate(&self, forget_session: bool) {
        let mut inner = self.inner();
        if inner.state != PostState::Inactive {
            // Any state may become Inactive.
            let _ = inner.state.transition(PostState::Inactive);
        }
        inner.clear_voter();
        if forget_session {
            inner.session = None;
        }
        drop(inner);
        self.presenter.update();
    }
}

#[async_trait]
impl KeepAlive for Post {
    fn contact(&self) -> &UrnContact {
        &self.contact
    }

    fn is_authenticated(&self) -> bool {
        !matches!(self.state(), PostState::Inactive | PostState::ToRestart)
    }

    async fn authenticate(&self) -> Result<()> {
        self.state().expect(&[PostState::Inactive, PostState::ToRestart])?;
        let public_key = encode_public_key(self.booth.public())?;
        let welcome = auth::authenticate(
            self.contact.network.as_ref(),
            self.contact.urn,
            TerminalKind::Post,
            self.contact.key(),
            vec![(field::PUBLIC_KEY, Value::Bytes(public_key))],
            &[
                (field::STATION, FieldType::Text),
                (field::COUNTING_KEY, FieldType::Bytes),
                (field::BALLOTS, FieldType::Object),
            ],
        )
        .await?;

        let station: SocketAddr = welcome
            .text(field::STATION)?
            .parse()
            .map_err(|e| Error::malformed(format!("station address: {e}")))?;
        let counting_key = decode_public_key(welcome.bytes(field::COUNTING_KEY)?)?;
        let templates: Vec<EmptyBallot> = welcome.object(field::BALLOTS)?;
        for template in &templates {
            template.validate()?;
        }

        {
            let mut inner = self.inner();
            inner.state.transition(PostState::Active)?;
            inner.station = Some(station);
            inner.session = Some(VotingSession::new(
                counting_key,
                self.contact.secret(),
                self.booth.clone(),
            ));
            inner.templates = templates;
            inner.clear_voter();
        }
        self.notify_station().await;
        self.presenter.update();
        Ok(())
    }

    async fn invalid_authentication(&self, err: Error) {
        {
            let mut inner = self.inner();
            if let Err(e) = inner.state.transition(PostState::ToRestart) {
                debug!("Ignoring revocation: {e}");
                return;
            }
            inner.clear_voter();
            inner.session = None;
        }
        self.presenter.print_warning("Authentication revoked", err.specific_message());
        self.notify_station().await;
        self.presenter.update();
    }
}

#[async_trait]
impl Terminal for Post {
    fn kind(&self) -> TerminalKind {
        TerminalKind::Post
    }

    async fn before_start(&self) -> Result<()> {
        // Fail early on a key the Urn could not verify.
        encode_public_key(self.booth.public())?;
        Ok(())
    }

    fn verify_peer_ip(&self, command: Command, peer: IpAddr) -> bool {
        match command {
            Command::UrnShutdown => peer == self.contact.urn.ip(),
            Command::Association
            | Command::DestroyAssociation
            | Command::ResetPost
            | Command::PostState
            | Command::StationShutdown => self.station().map(|station| station.ip()) == Some(peer),
            _ => false,
        }
    }

    async fn handle(&self, command: Command, link: &mut Link) -> Result<()> {
        let request = link.receive().await?;
        let reply = match command {
            Command::Association => self.associate(request)?,
            Command::DestroyAssociation => self.release(request)?,
            Command::ResetPost => {
                self.reset()?;
                self.inner().state_message()
            }
            Command::PostState => self.inner().state_message(),
            Command::StationShutdown => {
                self.deactivate(false);
                Message::ack()
            }
            Command::UrnShutdown => {
                self.deactivate(true);
                Message::ack()
            }
            _ => return Err(Error::new(Code::UnknownCommand, format!("post cannot handle {command}"))),
        };
        self.presenter.update();
        link.send(&reply).await
    }

    fn has_card_reader(&self) -> bool {
        true
    }

    async fn read_card(&self, badge: &str) -> CardOutcome {
        match self.start_voting(badge).await {
            Ok(()) => CardOutcome::VotingStarted,
            Err(err) => {
                self.presenter.print_error(&err);
                CardOutcome::Rejected(err.specific_message().to_string())
            }
        }
    }

    fn polls(&self) -> bool {
        true
    }

    async fn poll(&self) {
        keep_alive(self).await;
    }

    async fn after_close(&self) {
        self.deactivate(true);
    }
}
