use crate::firehose::{ConsumerError, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION};

/// What the nozzle does about a terminated subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Normal closure. Nothing is logged.
    Ignore,
    /// The traffic controller dropped us for falling behind.
    AlertSlowConsumer,
    /// Any other termination.
    LogOnly,
}

/// Maps a termination cause to the action the nozzle takes.
pub fn classify(err: &ConsumerError) -> CloseAction {
    match err.close_code() {
        Some(CLOSE_NORMAL) => CloseAction::Ignore,
        Some(CLOSE_POLICY_VIOLATION) => CloseAction::AlertSlowConsumer,
        _ => CloseAction::LogOnly,
    }
}
