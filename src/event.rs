//! The event loop interface the library consumes.
//!
//! The library does not own a thread and does not block: it registers
//! interest in timers and file-descriptor readiness with the host
//! application's event loop and gets driven through the entry points on
//! [`Context`]. The host implements [`EventLoop`] as a thin shim over
//! whatever loop it runs, stores the [`Token`] values passed to it, and
//! hands each one back through [`Context::on_timer`],
//! [`Context::on_readable`] or [`Context::on_writable`] when the
//! registered event fires.
//!
//! All timers are one-shot. Registrations are identified by their token
//! alone; registering the same file descriptor for reading and writing
//! uses two distinct tokens.
//!
//! [`Context`]: crate::Context
//! [`Context::on_timer`]: crate::Context::on_timer
//! [`Context::on_readable`]: crate::Context::on_readable
//! [`Context::on_writable`]: crate::Context::on_writable

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

//------------ Token ---------------------------------------------------------

/// An opaque identifier for a timer or readiness registration.
///
/// Tokens are allocated by the library and meaningful only to it; the
/// host treats them as opaque values to store and return.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Token(pub u64);

/// Token kind: a UDP pool socket became readable.
pub(crate) const KIND_UDP: u64 = 0;

/// Token kind: an operation's attempt timer fired.
pub(crate) const KIND_TIMER: u64 = 1;

/// Token kind: an operation's TCP connection became ready.
pub(crate) const KIND_TCP: u64 = 2;

/// Token kind: the zero-delay delivery tick.
pub(crate) const KIND_DELIVER: u64 = 3;

impl Token {
    /// Packs a kind and a payload into a token.
    ///
    /// The kind lives in the top two bits, leaving 62 bits of payload.
    pub(crate) fn pack(kind: u64, payload: u64) -> Self {
        debug_assert!(kind < 4 && payload < 1 << 62);
        Token(kind << 62 | payload)
    }

    /// Returns the kind of the token.
    pub(crate) fn kind(self) -> u64 {
        self.0 >> 62
    }

    /// Returns the payload of the token.
    pub(crate) fn payload(self) -> u64 {
        self.0 & ((1 << 62) - 1)
    }
}

//------------ EventLoop -----------------------------------------------------

/// What the library needs from the host's event loop.
pub trait EventLoop {
    /// Arms a one-shot timer that fires after `delay`.
    ///
    /// When it fires the host calls [`Context::on_timer`] with the token.
    /// A zero delay requests a callback on the next loop iteration.
    ///
    /// [`Context::on_timer`]: crate::Context::on_timer
    fn add_timer(&mut self, delay: Duration, token: Token);

    /// Cancels a previously armed timer.
    ///
    /// Cancelling a timer that already fired or never existed is allowed
    /// and does nothing.
    fn cancel_timer(&mut self, token: Token);

    /// Registers interest in readability of a file descriptor.
    fn add_reader(&mut self, fd: RawFd, token: Token);

    /// Drops interest in readability.
    fn cancel_reader(&mut self, token: Token);

    /// Registers interest in writability of a file descriptor.
    fn add_writer(&mut self, fd: RawFd, token: Token);

    /// Drops interest in writability.
    fn cancel_writer(&mut self, token: Token);

    /// Returns the loop's monotonic clock.
    fn now(&self) -> Instant;
}
