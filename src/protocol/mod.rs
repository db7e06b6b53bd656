//! The wire protocol: a command line followed by base64-encoded message lines.

pub mod client;
pub mod command;
pub mod message;

pub use client::{notify, request};
pub use command::Command;
pub use message::{FieldType, Message, MessageState, Unverified, Value, Verified};
