use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::error::{Code, Error};
use crate::model::TerminalKind;

/// The tag on the first line of every connection, selecting the handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    AuthenticationPhaseOne(TerminalKind),
    AuthenticationPhaseTwo(TerminalKind),
    CheckAuthentication,
    SearchPerson,
    Ballots,
    SendVote,
    Association,
    DestroyAssociation,
    ResetPost,
    PostState,
    PostStateNotify,
    ReadCard,
    StationShutdown,
    StationActive,
    UrnShutdown,
}

impl Command {
    pub const ALL: [Command; 19] = [
        Command::AuthenticationPhaseOne(TerminalKind::Post),
        Command::AuthenticationPhaseTwo(TerminalKind::Post),
        Command::AuthenticationPhaseOne(TerminalKind::Station),
        Command::AuthenticationPhaseTwo(TerminalKind::Station),
        Command::AuthenticationPhaseOne(TerminalKind::SubStation),
        Command::AuthenticationPhaseTwo(TerminalKind::SubStation),
        Command::CheckAuthentication,
        Command::SearchPerson,
        Command::Ballots,
        Command::SendVote,
        Command::Association,
        Command::DestroyAssociation,
        Command::ResetPost,
        Command::PostState,
        Command::PostStateNotify,
        Command::ReadCard,
        Command::StationShutdown,
        Command::StationActive,
        Command::UrnShutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        use TerminalKind::*;
        match self {
            Self::AuthenticationPhaseOne(Post) => "PostAuthenticationPhase1",
            Self::AuthenticationPhaseTwo(Post) => "PostAuthenticationPhase2",
            Self::AuthenticationPhaseOne(Station) => "StationAuthenticationPhase1",
            Self::AuthenticationPhaseTwo(Station) => "StationAuthenticationPhase2",
            Self::AuthenticationPhaseOne(SubStation) => "SubStationAuthenticationPhase1",
            Self::AuthenticationPhaseTwo(SubStation) => "SubStationAuthenticationPhase2",
            // The Urn never authenticates with itself.
            Self::AuthenticationPhaseOne(Urn) => "UrnAuthenticationPhase1",
            Self::AuthenticationPhaseTwo(Urn) => "UrnAuthenticationPhase2",
            Self::CheckAuthentication => "checkAuthentication",
            Self::SearchPerson => "searchPersonReq",
            Self::Ballots => "ballotsReq",
            Self::SendVote => "sendVoteToUrn",
            Self::Association => "associationReq",
            Self::DestroyAssociation => "destroyAssociationReq",
            Self::ResetPost => "resetPostReq",
            Self::PostState => "postStateReq",
            Self::PostStateNotify => "postStateNotify",
            Self::ReadCard => "readCardReq",
            Self::StationShutdown => "stationShutdown",
            Self::StationActive => "stationActive",
            Self::UrnShutdown => "urnShutdown",
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = s.trim();
        Self::ALL
            .into_iter()
            .find(|command| command.as_str() == tag)
            .ok_or_else(|| Error::new(Code::UnknownCommand, format!("unknown command `{tag}`")))
    }
}
