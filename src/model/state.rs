use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Badge value of a Post with no voter assigned.
pub const UNASSIGNED_BADGE: &str = "NONE";

/// A terminal state enum with an explicit table of legal transitions.
pub trait StateMachine: Copy + Debug + PartialEq {
    fn can_become(&self, next: Self) -> bool;

    /// Move `self` to `next`, or fail without mutating if the transition is illegal.
    fn transition(&mut self, next: Self) -> Result<()> {
        if !self.can_become(next) {
            return Err(Error::wrong_state(format!(
                "illegal transition {self:?} -> {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    /// Fail unless currently in one of `expected`.
    fn expect(&self, expected: &[Self]) -> Result<()> {
        if expected.contains(self) {
            Ok(())
        } else {
            Err(Error::wrong_state(format!(
                "in state {self:?}, expected one of {expected:?}"
            )))
        }
    }
}

/// Lifecycle of a voting booth.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostState {
    /// Not authenticated with the Urn.
    Inactive,
    /// Authenticated and free.
    Active,
    /// Reserved for a voter, waiting for their badge.
    Associated,
    /// The voter is filling in their ballots.
    InUse,
    /// Ballots accepted by the Urn, waiting for the badge to be returned.
    VoteSent,
    /// Authorisation was revoked; must authenticate again.
    ToRestart,
    /// Detected inconsistency; must be reset by the Station.
    ToReset,
}

impl PostState {
    /// Can the Station hand this Post to a new voter?
    pub fn is_available(&self) -> bool {
        *self == Self::Active
    }
}

impl StateMachine for PostState {
    fn can_become(&self, next: Self) -> bool {
        use PostState::*;
        match (*self, next) {
            // Shutdown of the Station or Urn, and detected inconsistencies.
            (_, Inactive) => true,
            (Inactive, ToReset) => false,
            (_, ToReset) | (_, ToRestart) => true,

            (Inactive, Active) | (ToRestart, Active) | (ToReset, Active) => true,
            (Active, Associated) => true,
            (Associated, InUse) | (Associated, Active) => true,
            (InUse, VoteSent) | (InUse, Active) => true,
            (VoteSent, Active) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StationState {
    Inactive,
    Active,
}

impl StateMachine for StationState {
    fn can_become(&self, next: Self) -> bool {
        *self != next
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubStationState {
    Inactive,
    Active,
    /// Authenticated, but the parent Station is offline.
    Waiting,
}

impl StateMachine for SubStationState {
    fn can_become(&self, next: Self) -> bool {
        use SubStationState::*;
        matches!(
            (*self, next),
            (_, Inactive) | (Inactive, Active) | (Active, Waiting) | (Waiting, Active)
        ) && *self != next
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UrnState {
    /// No voting session selected.
    Inactive,
    /// A session is selected; terminals may authenticate.
    Active,
    /// An operator has logged in.
    Logging,
}

impl UrnState {
    /// Are terminals allowed to authenticate and vote?
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Active | Self::Logging)
    }
}

impl StateMachine for UrnState {
    fn can_become(&self, next: Self) -> bool {
        use UrnState::*;
        matches!(
            (*self, next),
            (Inactive, Active) | (Active, Logging) | (Logging, Active) | (Active, Inactive) | (Logging, Inactive)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;

    #[test]
    fn post_voting_cycle() {
        let mut state = PostState::Inactive;
        for next in [
            PostState::Active,
            PostState::Associated,
            PostState::InUse,
            PostState::VoteSent,
            PostState::Active,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.is_available());
    }

    #[test]
    fn illegal_post_transitions_do_not_mutate() {
        let mut state = PostState::Associated;
        let err = state.transition(PostState::VoteSent).unwrap_err();
        assert_eq!(err.code(), Code::WrongState);
        assert_eq!(state, PostState::Associated);

        let mut inactive = PostState::Inactive;
        assert!(inactive.transition(PostState::Associated).is_err());
        assert!(inactive.transition(PostState::ToReset).is_err());
        assert_eq!(inactive, PostState::Inactive);
    }

    #[test]
    fn post_recovery_paths() {
        for from in [PostState::Active, PostState::InUse, PostState::VoteSent] {
            assert!(from.can_become(PostState::ToReset));
            assert!(from.can_become(PostState::ToRestart));
            assert!(from.can_become(PostState::Inactive));
        }
        assert!(PostState::ToReset.can_become(PostState::Active));
        assert!(PostState::ToRestart.can_become(PostState::Active));
        assert!(!PostState::ToReset.can_become(PostState::Associated));
    }

    #[test]
    fn expect_lists_states() {
        let state = SubStationState::Waiting;
        assert!(state.expect(&[SubStationState::Active, SubStationState::Waiting]).is_ok());
        assert!(state.expect(&[SubStationState::Active]).is_err());
    }

    #[test]
    fn substation_and_urn() {
        let mut sub = SubStationState::Inactive;
        assert!(sub.transition(SubStationState::Waiting).is_err());
        sub.transition(SubStationState::Active).unwrap();
        sub.transition(SubStationState::Waiting).unwrap();
        sub.transition(SubStationState::Inactive).unwrap();

        let mut urn = UrnState::Inactive;
        assert!(!urn.is_open());
        assert!(urn.transition(UrnState::Logging).is_err());
        urn.transition(UrnState::Active).unwrap();
        urn.transition(UrnState::Logging).unwrap();
        assert!(urn.is_open());

        let mut station = StationState::Active;
        assert!(station.transition(StationState::Active).is_err());
        station.transition(StationState::Inactive).unwrap();
    }
}
