//! Plain data shared by every terminal: ballot templates, voters, terminal kinds and states.

pub mod ballot;
pub mod encoding;
pub mod person;
pub mod state;
pub mod terminal;

pub use ballot::{Candidate, ElectoralList, EmptyBallot, BLANK_PREFERENCE};
pub use person::Person;
pub use state::{PostState, StateMachine, StationState, SubStationState, UrnState, UNASSIGNED_BADGE};
pub use terminal::{StationLayout, TerminalKind};
