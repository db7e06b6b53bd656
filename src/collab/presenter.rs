use crate::error::Error;

/// The presentation collaborator. Terminals report outcomes here and ask it
/// to redraw; they own no rendering logic.
pub trait Presenter: Send + Sync + 'static {
    fn print_error(&self, err: &Error);

    fn print_success(&self, title: &str, message: &str);

    fn print_warning(&self, title: &str, message: &str);

    /// Ask the operator to confirm an action.
    fn print_confirmation(&self, title: &str, message: &str) -> bool;

    /// Schedule a redraw from the terminal's current state.
    fn update(&self);
}

/// Writes every notification to the log and confirms everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn print_error(&self, err: &Error) {
        error!("{}: {}", err.generic_message(), err.specific_message());
    }

    fn print_success(&self, title: &str, message: &str) {
        info!("{title}: {message}");
    }

    fn print_warning(&self, title: &str, message: &str) {
        warn!("{title}: {message}");
    }

    fn print_confirmation(&self, title: &str, message: &str) -> bool {
        info!("{title}: {message} (confirmed)");
        true
    }

    fn update(&self) {
        trace!("Redraw requested");
    }
}
