//! The per-query state machine.
//!
//! One [`Operation`] exists per user lookup. It walks a list of
//! candidate names (the bare name and its search-suffix expansions), and
//! for each candidate cycles over the nameservers, sending the same
//! query datagram until a matching reply arrives, the reply forces an
//! upgrade to TCP, or the attempt budget runs out.
//!
//! ```text
//! initial --start--> awaiting-udp-reply --match,tc=0--------> done
//!                    |        |          --match,tc=1--> awaiting-tcp-reply
//!                    |        +--timer--> next server / next suffix / failed
//!                    |                                   |        |
//!                    |                                   |  reply: done
//!                    +------<---- connect error/timeout--+
//! ```
//!
//! The operation never frees itself: it lives in the context's arena and
//! is reached through a generation-tagged [`OpId`]. Methods return a
//! [`Verdict`] and the context performs the terminal bookkeeping, so a
//! handler callback never runs while the arena is borrowed.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::base::header::Opcode;
use crate::base::name;
use crate::bits::Bits;
use crate::conf::Nameserver;
use crate::context::Handler;
use crate::core::Core;
use crate::error::Error;
use crate::event::{EventLoop, Token, KIND_TCP, KIND_TIMER};
use crate::query::Query;
use crate::response::{Response, RCODE_NXDOMAIN};
use crate::tcp::TcpConn;

/// Generations are packed into tokens next to a 32-bit index, so they
/// get 30 bits.
const GEN_MASK: u32 = 0x3fff_ffff;

//------------ OpId ----------------------------------------------------------

/// A copyable handle to an operation.
///
/// The handle carries the arena index and a generation tag. Every
/// dereference checks the tag against the arena slot, so a handle to a
/// finished or cancelled operation is simply inert: cancelling it again,
/// or a late timer firing for it, does nothing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct OpId {
    /// The slot index in the operation arena.
    index: u32,

    /// The generation the slot had when the operation was created.
    generation: u32,
}

impl OpId {
    /// Creates a handle.
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        OpId {
            index: index as u32,
            generation: generation & GEN_MASK,
        }
    }

    /// Returns the arena index.
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }

    /// Returns the generation tag.
    pub(crate) fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the handle into a token payload.
    pub(crate) fn to_payload(self) -> u64 {
        u64::from(self.generation) << 32 | u64::from(self.index)
    }

    /// Unpacks a handle from a token payload.
    pub(crate) fn from_payload(payload: u64) -> Self {
        OpId {
            index: payload as u32,
            generation: (payload >> 32) as u32 & GEN_MASK,
        }
    }
}

//------------ Deps ----------------------------------------------------------

/// The context facilities an operation acts through.
///
/// Handed in per call so that the operation, which lives inside the
/// context's arena, can use the loop, the socket pool and the core
/// without aliasing the arena itself.
pub(crate) struct Deps<'a> {
    /// The host event loop.
    pub lp: &'a mut dyn EventLoop,

    /// The shared socket pool.
    pub pool: &'a mut crate::udp::UdpPool,

    /// The shared core bookkeeping.
    pub core: &'a mut Core,
}

//------------ Verdict -------------------------------------------------------

/// What the context should do after an operation handled an event.
#[derive(Debug)]
pub(crate) enum Verdict {
    /// Nothing; the operation is still in flight.
    Continue,

    /// The datagram just dispatched is the answer.
    Done,

    /// A reply arrived over TCP; these are its octets.
    DoneTcp(Vec<u8>),

    /// Every avenue was exhausted without an answer.
    Timeout,

    /// The operation failed terminally.
    Failed(Error),
}

//------------ Operation -----------------------------------------------------

/// One in-flight lookup.
pub(crate) struct Operation {
    /// The own handle, used to mint timer and TCP tokens.
    id: OpId,

    /// The user's handler.
    pub(crate) handler: Rc<dyn Handler>,

    /// What the message asks, kept for rebuilding across candidates.
    opcode: Opcode,
    qtype: u16,
    bits: Bits,

    /// The candidate names, in the order they are tried.
    candidates: Vec<String>,

    /// Index of the candidate currently in flight.
    candidate: usize,

    /// The wire form of the current candidate's query.
    query: Query,

    /// Whether the query's id is registered with the core.
    registered: bool,

    /// The nameservers this operation walks.
    servers: Vec<Nameserver>,

    /// Where the walk starts (advanced globally in rotate mode).
    start: usize,

    /// The current position of the walk; index is `cursor % servers`.
    cursor: usize,

    /// Datagrams sent for the current candidate.
    sends: usize,

    /// Send budget per candidate: attempts passes over the server list.
    max_sends: usize,

    /// The server the live attempt went to. Replies from anywhere else
    /// are spoofs or strays and get dropped.
    target: Option<Nameserver>,

    /// Whether any send was ever accepted by the kernel.
    sent_any: bool,

    /// When the live attempt was sent, for the RTT hint.
    sent_at: Instant,

    /// Sticky failure to report instead of a plain timeout.
    fail: Option<Error>,

    /// The TCP upgrade, while one is in flight.
    tcp: Option<TcpConn>,
}

impl Operation {
    /// Creates the operation and fires its first datagram.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        deps: &mut Deps,
        id: OpId,
        handler: Rc<dyn Handler>,
        opcode: Opcode,
        candidates: Vec<String>,
        qtype: u16,
        bits: Bits,
        data: Option<&str>,
        servers: Vec<Nameserver>,
    ) -> Result<Self, Error> {
        debug_assert!(!candidates.is_empty() && !servers.is_empty());
        let txid = deps.core.allocate(id)?;
        let query = match Query::build(
            opcode,
            &candidates[0],
            qtype,
            bits,
            data,
            txid,
            deps.core.conf.payload_size,
        ) {
            Ok(query) => query,
            Err(err) => {
                deps.core.unregister(txid);
                return Err(err);
            }
        };
        let start = deps.core.next_start(servers.len());
        let max_sends = deps.core.conf.attempts * servers.len();
        let mut op = Operation {
            id,
            handler,
            opcode,
            qtype,
            bits,
            candidates,
            candidate: 0,
            query,
            registered: true,
            servers,
            start,
            cursor: start,
            sends: 0,
            max_sends,
            target: None,
            sent_any: false,
            sent_at: deps.lp.now(),
            fail: None,
            tcp: None,
        };
        op.send_current(deps);
        Ok(op)
    }

    /// Returns the token of the attempt timer.
    pub fn timer_token(&self) -> Token {
        Token::pack(KIND_TIMER, self.id.to_payload())
    }

    /// Returns the token of the TCP registrations.
    fn tcp_token(&self) -> Token {
        Token::pack(KIND_TCP, self.id.to_payload())
    }

    /// A datagram with this operation's id arrived.
    pub fn on_datagram(
        &mut self,
        deps: &mut Deps,
        src: SocketAddr,
        response: &Response,
    ) -> Verdict {
        let Some(target) = self.target else {
            return Verdict::Continue;
        };
        let expected = SocketAddr::new(target.ip.into(), target.port);
        if src != expected {
            warn!(
                %src, %expected,
                "dropping reply from unexpected source"
            );
            return Verdict::Continue;
        }
        if !self.query.matches(response) {
            debug!(id = response.id(), "dropping non-matching reply");
            return Verdict::Continue;
        }

        deps.core.note_rtt(
            target.ip,
            deps.lp.now().saturating_duration_since(self.sent_at),
        );

        if response.truncated() {
            debug!(server = %target.ip, "truncated reply, upgrading to tcp");
            return self.upgrade(deps, expected);
        }
        if response.rcode() == RCODE_NXDOMAIN
            && self.candidate + 1 < self.candidates.len()
        {
            debug!(
                name = %self.candidates[self.candidate],
                "nxdomain, advancing to next search suffix"
            );
            deps.lp.cancel_timer(self.timer_token());
            return self.next_candidate(deps);
        }
        Verdict::Done
    }

    /// The attempt timer fired.
    pub fn on_timer(&mut self, deps: &mut Deps) -> Verdict {
        if let Some(conn) = self.tcp.take() {
            debug!("tcp attempt timed out");
            conn.close(deps.lp);
            return self.fallback(deps);
        }
        self.cursor += 1;
        self.advance(deps)
    }

    /// The TCP connection became readable.
    pub fn tcp_readable(&mut self, deps: &mut Deps) -> Verdict {
        let Some(conn) = self.tcp.as_mut() else {
            return Verdict::Continue;
        };
        match conn.on_readable() {
            Ok(None) => Verdict::Continue,
            Ok(Some(reply)) => {
                let matched = match Response::parse(&reply) {
                    Ok(response) => self.query.matches(&response),
                    Err(_) => false,
                };
                if matched {
                    Verdict::DoneTcp(reply)
                } else {
                    warn!("unusable reply over tcp");
                    Verdict::Failed(Error::ProtocolError)
                }
            }
            Err(err) => {
                warn!(%err, "tcp receive failed");
                self.fail.get_or_insert(Error::TransportFailure);
                self.fallback(deps)
            }
        }
    }

    /// The TCP connection became writable.
    pub fn tcp_writable(&mut self, deps: &mut Deps) -> Verdict {
        let Some(conn) = self.tcp.as_mut() else {
            return Verdict::Continue;
        };
        match conn.on_writable(deps.lp) {
            Ok(()) => Verdict::Continue,
            Err(err) => {
                warn!(%err, "tcp connect or send failed");
                self.fail.get_or_insert(Error::TransportFailure);
                self.fallback(deps)
            }
        }
    }

    /// Releases everything the operation holds.
    ///
    /// Called by the context when the operation leaves the arena, on
    /// completion and cancellation alike. Returns the handler for the
    /// terminal callback.
    pub fn retire(
        mut self,
        lp: &mut dyn EventLoop,
        core: &mut Core,
    ) -> Rc<dyn Handler> {
        lp.cancel_timer(self.timer_token());
        if self.registered {
            core.unregister(self.query.id());
        }
        if let Some(conn) = self.tcp.take() {
            conn.close(lp);
        }
        self.handler
    }

    /// Sends the current query to the server under the cursor and arms
    /// the attempt timer.
    ///
    /// A send failure is transient by definition here: the timer keeps
    /// running and the next fire moves on to another server.
    fn send_current(&mut self, deps: &mut Deps) {
        let server = self.servers[self.cursor % self.servers.len()];
        self.target = Some(server);
        self.sends += 1;
        let addr = SocketAddr::new(server.ip.into(), server.port);
        match deps.pool.send(deps.lp, addr, self.query.bytes()) {
            Ok(()) => {
                self.sent_any = true;
                // A fresh datagram is in flight; if it goes unanswered
                // the outcome is a timeout, not the older hard failure.
                self.fail = None;
                self.sent_at = deps.lp.now();
                debug!(
                    server = %server.ip,
                    id = self.query.id(),
                    send = self.sends,
                    "query sent"
                );
            }
            Err(err) => {
                debug!(%err, server = %server.ip, "transient send failure");
            }
        }
        deps.lp
            .add_timer(deps.core.conf.timeout, self.timer_token());
    }

    /// Retries within the current candidate or moves on.
    fn advance(&mut self, deps: &mut Deps) -> Verdict {
        if self.sends < self.max_sends {
            self.send_current(deps);
            return Verdict::Continue;
        }
        self.next_candidate(deps)
    }

    /// Starts the next candidate name, or ends the operation.
    fn next_candidate(&mut self, deps: &mut Deps) -> Verdict {
        if self.candidate + 1 >= self.candidates.len() {
            return self.terminal();
        }
        self.candidate += 1;
        if let Err(err) = self.rebuild(deps) {
            return Verdict::Failed(err);
        }
        self.cursor = self.start;
        self.sends = 0;
        self.send_current(deps);
        Verdict::Continue
    }

    /// Builds a fresh query, with a fresh id, for the current candidate.
    fn rebuild(&mut self, deps: &mut Deps) -> Result<(), Error> {
        if self.registered {
            deps.core.unregister(self.query.id());
            self.registered = false;
        }
        let txid = deps.core.allocate(self.id)?;
        match Query::build(
            self.opcode,
            &self.candidates[self.candidate],
            self.qtype,
            self.bits,
            None,
            txid,
            deps.core.conf.payload_size,
        ) {
            Ok(query) => {
                self.query = query;
                self.registered = true;
                Ok(())
            }
            Err(err) => {
                deps.core.unregister(txid);
                Err(err)
            }
        }
    }

    /// Re-asks the current server over TCP after a truncated reply.
    ///
    /// The id registration is released while the TCP exchange runs; the
    /// connection is solicited, so inbound datagram matching no longer
    /// applies to it.
    fn upgrade(&mut self, deps: &mut Deps, target: SocketAddr) -> Verdict {
        deps.lp.cancel_timer(self.timer_token());
        deps.core.unregister(self.query.id());
        self.registered = false;
        match TcpConn::connect(
            deps.lp,
            target,
            self.query.bytes(),
            self.tcp_token(),
        ) {
            Ok(conn) => {
                self.tcp = Some(conn);
                deps.lp
                    .add_timer(deps.core.conf.timeout, self.timer_token());
                Verdict::Continue
            }
            Err(err) => {
                warn!(%err, "tcp connect failed");
                self.fail.get_or_insert(Error::TransportFailure);
                self.fallback(deps)
            }
        }
    }

    /// Resumes UDP after a failed TCP attempt, or gives up.
    fn fallback(&mut self, deps: &mut Deps) -> Verdict {
        deps.lp.cancel_timer(self.timer_token());
        if let Some(conn) = self.tcp.take() {
            conn.close(deps.lp);
        }
        if !self.registered {
            if deps.core.reregister(self.query.id(), self.id) {
                self.registered = true;
            } else {
                // The id went to someone else while we were on TCP.
                match deps.core.allocate(self.id) {
                    Ok(txid) => {
                        self.query.set_id(txid);
                        self.registered = true;
                    }
                    Err(err) => return Verdict::Failed(err),
                }
            }
        }
        self.cursor += 1;
        self.advance(deps)
    }

    /// The final verdict when nothing is left to try.
    fn terminal(&mut self) -> Verdict {
        if let Some(err) = self.fail.take() {
            return Verdict::Failed(err);
        }
        if !self.sent_any {
            // Not one datagram made it out; a timeout would be
            // misleading.
            return Verdict::Failed(Error::TransportFailure);
        }
        Verdict::Timeout
    }
}

//------------ Search expansion ----------------------------------------------

/// Expands a queried name into the candidate names to try, in order.
///
/// An absolute name (trailing dot) and anything queried without a search
/// list is tried as given. A relative name with fewer dots than `ndots`
/// is tried under each suffix only; with enough dots the bare name comes
/// first and the suffixes after.
pub(crate) fn candidates(
    qname: &str,
    search: &[String],
    ndots: usize,
) -> Vec<String> {
    if qname.ends_with('.') || search.is_empty() {
        return vec![qname.into()];
    }
    let mut out = Vec::with_capacity(search.len() + 1);
    if name::dots(qname) >= ndots {
        out.push(qname.into());
    }
    for suffix in search {
        let suffix = suffix.as_str();
        if suffix.is_empty() || suffix == "." {
            out.push(format!("{}.", qname));
        } else {
            out.push(format!("{}.{}", qname, suffix));
        }
    }
    out
}

//============ Testing ======================================================
