#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate terminal_test;

pub mod auth;
pub mod collab;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod model;
pub mod net;
pub mod protocol;
pub mod scheduled_task;
pub mod terminal;
pub mod vote;

#[cfg(test)]
pub(crate) mod testing;
