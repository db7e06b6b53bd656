//! Turning a voter's choices into encrypted, signed packets and back.

pub mod ballot;
pub mod nonces;
pub mod packet;
pub mod session;

pub use ballot::{Preference, WrittenBallot};
pub use packet::VotePacket;
pub use session::VotingSession;
