//! Collaborators the terminals depend on: storage, presentation and the card reader.

pub mod card_reader;
pub mod memory_store;
pub mod persistence;
pub mod presenter;

pub use card_reader::{BadgeHandler, CardOutcome, CardReader, CardReaderHandle};
pub use memory_store::{MemoryStore, StoreSeed};
pub use persistence::{Persistence, ProcedureCode, SessionCode};
pub use presenter::{LogPresenter, Presenter};
