//! An event-driven DNS stub resolver.
//!
//! This crate turns user lookups into wire-format queries, sends them to
//! one or more recursive nameservers over UDP, upgrades to TCP when a
//! response comes back truncated, retries on timeout, walks the search
//! path, and hands parsed responses to user-supplied handlers. It is a
//! library, not a daemon: it plugs into a host-provided event loop and
//! never owns a thread or blocks.
//!
//! # Usage
//!
//! Implement [`EventLoop`] as a shim over your application's loop, build
//! a [`Config`] (or parse one from `resolv.conf` via [`Config::system`]),
//! and create a [`Context`]. Lookups are started with
//! [`Context::query`]; the outcome arrives at your [`Handler`] as
//! exactly one of `on_received`, `on_timeout` or `on_failure`, unless
//! you cancel the returned handle first.
//!
//! The host has three duties: fire registered timers, report
//! registered file descriptors as readable or writable, and pass the
//! accompanying [`Token`] back into the matching `Context::on_*` entry
//! point. Everything else, socket pooling, transaction-id management,
//! retransmission, truncation upgrades and callback budgeting, happens
//! inside.
//!
//! # What this crate is not
//!
//! There is no recursion, no DNSSEC validation (the DO bit can be
//! requested and signatures are returned verbatim), no answer caching
//! and no decoding of record data beyond raw octets.

pub mod base;
pub mod bits;
pub mod conf;
pub mod context;
pub mod error;
pub mod event;
pub mod idgen;
pub mod ip;
pub mod op;
pub mod query;
pub mod response;

mod core;
mod tcp;
mod udp;

pub use self::bits::Bits;
pub use self::conf::{ConfError, Config, Mode, Nameserver};
pub use self::context::{Context, Handler};
pub use self::error::Error;
pub use self::event::{EventLoop, Token};
pub use self::idgen::{IdGenerator, RandomIds};
pub use self::ip::Ip;
pub use self::op::OpId;
pub use self::response::{Record, Response, Section};
