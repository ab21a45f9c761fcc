//! Errors surfaced to user code.

use thiserror::Error;

//------------ Error ---------------------------------------------------------

/// The ways a lookup can fail.
///
/// Errors during a single attempt never escape on their own; they advance
/// the operation's state machine. What arrives here is either rejected
/// input, reported synchronously from [`Context::query`], or a terminal
/// verdict delivered through [`Handler::on_failure`] after every avenue
/// was exhausted.
///
/// [`Context::query`]: crate::Context::query
/// [`Handler::on_failure`]: crate::Handler::on_failure
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    /// All attempts across all nameservers and suffixes timed out.
    #[error("all nameservers timed out")]
    Timeout,

    /// The query could not be built from the given inputs.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Sending or receiving failed beyond what timeout retry covers.
    #[error("network transport failed")]
    TransportFailure,

    /// A matching response arrived but was malformed beyond tolerance.
    #[error("malformed response")]
    ProtocolError,

    /// The operation was cancelled. Never delivered to a handler; the
    /// callback is suppressed instead.
    #[error("operation cancelled")]
    Cancelled,

    /// No free transaction id could be generated.
    #[error("transaction ids exhausted")]
    Exhausted,
}
