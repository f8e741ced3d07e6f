//! Error types for the coalescer.
//!
//! The coalescer never wraps the work function's own error; these are the
//! only failures it introduces, and only on the opt-in timeout paths.

use std::time::Duration;

/// Error returned to a joiner that stopped waiting for a flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    /// The flight did not finish within the caller's timeout.
    ///
    /// The owner keeps running; other joiners are unaffected.
    #[error("in-flight call did not complete within {waited:?}")]
    Timeout { waited: Duration },
}
