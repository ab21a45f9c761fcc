//! The public face of the resolver.
//!
//! A [`Context`] owns everything: the boxed host-loop adapter, the socket
//! pool, the id registry and the arena of in-flight operations. User code
//! starts lookups through [`Context::query`] and friends and gets the
//! outcome through its [`Handler`]; the host loop drives the machinery
//! through [`Context::on_timer`], [`Context::on_readable`] and
//! [`Context::on_writable`].
//!
//! Handlers are invoked with the context borrowed mutably, so a callback
//! may start new lookups or cancel existing ones, including the one it
//! is being called for. The arena hands out generation-tagged handles;
//! a handle whose operation is gone is inert everywhere.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use slab::Slab;
use tracing::debug;

use crate::base::header::Opcode;
use crate::bits::Bits;
use crate::conf::{Config, Nameserver};
use crate::core::Core;
use crate::error::Error;
use crate::event::{
    EventLoop, Token, KIND_DELIVER, KIND_TCP, KIND_TIMER, KIND_UDP,
};
use crate::idgen::{IdGenerator, RandomIds};
use crate::ip::Ip;
use crate::op::{self, Deps, OpId, Operation, Verdict};
use crate::query::TYPE_SOA;
use crate::response::Response;
use crate::udp::UdpPool;

//------------ Handler -------------------------------------------------------

/// What user code implements to receive lookup outcomes.
///
/// Exactly one of the three methods is called per started operation,
/// unless the operation is cancelled first, in which case none is.
pub trait Handler {
    /// A matching response arrived.
    fn on_received(&self, ctx: &mut Context, op: OpId, response: &Response);

    /// Every attempt across all nameservers and suffixes timed out.
    fn on_timeout(&self, ctx: &mut Context, op: OpId);

    /// The operation failed terminally.
    fn on_failure(&self, ctx: &mut Context, op: OpId, error: Error);
}

//------------ Context -------------------------------------------------------

/// A resolver plugged into a host event loop.
pub struct Context {
    /// The host loop adapter.
    lp: Box<dyn EventLoop>,

    /// Registry, configuration and the other shared bookkeeping.
    core: Core,

    /// The shared UDP socket pool.
    pool: UdpPool,

    /// The in-flight operations.
    ops: Slab<OpSlot>,

    /// Generation counter; bumped for every started operation.
    next_gen: u32,

    /// Whether a zero-delay delivery tick is currently armed.
    tick_armed: bool,
}

/// An arena slot: the operation and the generation tag of its handle.
struct OpSlot {
    /// The generation this slot was filled with.
    generation: u32,

    /// The operation itself.
    op: Operation,
}

impl Context {
    /// Creates a context with the default id generator.
    pub fn new(lp: Box<dyn EventLoop>, conf: Config) -> Self {
        Self::with_generator(lp, conf, Box::new(RandomIds::new()))
    }

    /// Creates a context with an injected id generator.
    ///
    /// Tests use this to make transaction ids deterministic.
    pub fn with_generator(
        lp: Box<dyn EventLoop>,
        mut conf: Config,
        idgen: Box<dyn IdGenerator>,
    ) -> Self {
        conf.finalize();
        let pool = UdpPool::new(conf.sockets, usize::from(conf.payload_size));
        Context {
            lp,
            core: Core::new(conf, idgen),
            pool,
            ops: Slab::new(),
            next_gen: 0,
            tick_armed: false,
        }
    }

    /// Returns the configuration in effect.
    pub fn config(&self) -> &Config {
        &self.core.conf
    }

    /// Returns the number of in-flight operations.
    pub fn outstanding(&self) -> usize {
        self.ops.len()
    }

    /// Returns whether undelivered datagrams are buffered in the pool.
    pub fn buffered(&self) -> bool {
        self.pool.buffered()
    }

    /// Returns the last observed round-trip time of a nameserver.
    pub fn last_rtt(&self, ip: Ip) -> Option<Duration> {
        self.core.rtt(ip)
    }
}

/// # Starting and cancelling lookups
///
impl Context {
    /// Starts a lookup with default bits (recursion desired).
    pub fn query(
        &mut self,
        qname: &str,
        qtype: u16,
        handler: Rc<dyn Handler>,
    ) -> Result<OpId, Error> {
        self.query_with(qname, qtype, Bits::default(), handler)
    }

    /// Starts a lookup with explicit header bits.
    pub fn query_with(
        &mut self,
        qname: &str,
        qtype: u16,
        bits: Bits,
        handler: Rc<dyn Handler>,
    ) -> Result<OpId, Error> {
        let candidates = op::candidates(
            qname,
            &self.core.conf.search,
            self.core.conf.ndots,
        );
        let servers = self.core.conf.nameservers.clone();
        self.start(Opcode::Query, candidates, qtype, bits, None, servers, handler)
    }

    /// Sends a NOTIFY for `zone` to one specific server.
    ///
    /// Notifies bypass the configured nameserver list and the search
    /// path: the zone name goes out as given, to the given server.
    pub fn notify(
        &mut self,
        target: Nameserver,
        zone: &str,
        handler: Rc<dyn Handler>,
    ) -> Result<OpId, Error> {
        self.start(
            Opcode::Notify,
            vec![zone.into()],
            TYPE_SOA,
            Bits::empty(),
            None,
            vec![target],
            handler,
        )
    }

    /// Cancels an operation.
    ///
    /// Idempotent: cancelling a finished, cancelled or otherwise unknown
    /// handle does nothing. No callback is invoked for a cancelled
    /// operation, even if its response is already buffered.
    pub fn cancel(&mut self, id: OpId) {
        if !self.is_live(id) {
            return;
        }
        let slot = self.ops.remove(id.index());
        let _ = slot.op.retire(&mut *self.lp, &mut self.core);
        debug!("operation cancelled");
    }

    /// Creates and fires an operation.
    #[allow(clippy::too_many_arguments)]
    fn start(
        &mut self,
        opcode: Opcode,
        candidates: Vec<String>,
        qtype: u16,
        bits: Bits,
        data: Option<&str>,
        servers: Vec<Nameserver>,
        handler: Rc<dyn Handler>,
    ) -> Result<OpId, Error> {
        if servers.is_empty() {
            return Err(Error::InvalidQuery(
                "no nameservers configured".into(),
            ));
        }
        let entry = self.ops.vacant_entry();
        self.next_gen = self.next_gen.wrapping_add(1);
        let id = OpId::new(entry.key(), self.next_gen);
        let mut deps = Deps {
            lp: &mut *self.lp,
            pool: &mut self.pool,
            core: &mut self.core,
        };
        let op = Operation::start(
            &mut deps, id, handler, opcode, candidates, qtype, bits, data,
            servers,
        )?;
        entry.insert(OpSlot {
            generation: id.generation(),
            op,
        });
        Ok(id)
    }
}

/// # Host loop entry points
///
impl Context {
    /// A timer registered by the library fired.
    pub fn on_timer(&mut self, token: Token) {
        match token.kind() {
            KIND_TIMER => {
                let id = OpId::from_payload(token.payload());
                let verdict = match self.with_op(id, Operation::on_timer) {
                    Some(verdict) => verdict,
                    None => return,
                };
                self.settle(id, verdict, None);
            }
            KIND_DELIVER => {
                self.tick_armed = false;
                let budget = self.core.conf.budget;
                self.deliver(budget);
            }
            _ => {}
        }
    }

    /// A file descriptor registered for reading became readable.
    pub fn on_readable(&mut self, token: Token) {
        match token.kind() {
            KIND_UDP => {
                self.pool.receive(token);
                let budget = self.core.conf.budget;
                self.deliver(budget);
            }
            KIND_TCP => {
                let id = OpId::from_payload(token.payload());
                let verdict =
                    match self.with_op(id, Operation::tcp_readable) {
                        Some(verdict) => verdict,
                        None => return,
                    };
                self.settle(id, verdict, None);
            }
            _ => {}
        }
    }

    /// A file descriptor registered for writing became writable.
    pub fn on_writable(&mut self, token: Token) {
        if token.kind() != KIND_TCP {
            return;
        }
        let id = OpId::from_payload(token.payload());
        let verdict = match self.with_op(id, Operation::tcp_writable) {
            Some(verdict) => verdict,
            None => return,
        };
        self.settle(id, verdict, None);
    }

    /// Delivers up to `max_calls` buffered datagrams.
    ///
    /// Returns the number actually dispatched. When a backlog remains, a
    /// zero-delay timer is armed so the host calls back on its next
    /// iteration; userspace callbacks can therefore never starve the
    /// loop, no matter how many responses arrived in one readability
    /// event.
    pub fn deliver(&mut self, max_calls: usize) -> usize {
        let mut count = 0;
        while count < max_calls {
            let Some((src, buf)) = self.pool.pop() else { break };
            self.dispatch(src, &buf);
            count += 1;
        }
        if self.pool.buffered() && !self.tick_armed {
            self.tick_armed = true;
            self.lp
                .add_timer(Duration::ZERO, Token::pack(KIND_DELIVER, 0));
        }
        count
    }
}

/// # Internal dispatch
///
impl Context {
    /// Returns whether a handle refers to a live operation.
    fn is_live(&self, id: OpId) -> bool {
        self.ops
            .get(id.index())
            .map_or(false, |slot| slot.generation == id.generation())
    }

    /// Runs an operation method with the shared facilities.
    fn with_op(
        &mut self,
        id: OpId,
        f: impl FnOnce(&mut Operation, &mut Deps) -> Verdict,
    ) -> Option<Verdict> {
        let slot = self.ops.get_mut(id.index())?;
        if slot.generation != id.generation() {
            return None;
        }
        let mut deps = Deps {
            lp: &mut *self.lp,
            pool: &mut self.pool,
            core: &mut self.core,
        };
        Some(f(&mut slot.op, &mut deps))
    }

    /// Routes one received datagram to the operation waiting on its id.
    fn dispatch(&mut self, src: SocketAddr, bytes: &[u8]) {
        let response = match Response::parse(bytes) {
            Ok(response) => response,
            Err(_) => {
                debug!(%src, "dropping unparsable datagram");
                return;
            }
        };
        let id = match self.core.lookup(response.id()) {
            Some(id) => id,
            None => {
                debug!(
                    id = response.id(),
                    "dropping reply for unknown transaction"
                );
                return;
            }
        };
        let verdict = match self.with_op(id, |op, deps| {
            op.on_datagram(deps, src, &response)
        }) {
            Some(verdict) => verdict,
            None => return,
        };
        self.settle(id, verdict, Some(bytes));
    }

    /// Applies a verdict: terminal verdicts remove the operation and run
    /// its one callback.
    fn settle(&mut self, id: OpId, verdict: Verdict, answer: Option<&[u8]>) {
        match verdict {
            Verdict::Continue => {}
            Verdict::Done => {
                let bytes =
                    answer.expect("datagram verdict outside dispatch");
                if let Some(handler) = self.finish(id) {
                    let response = Response::parse(bytes)
                        .expect("matched response parses");
                    handler.on_received(self, id, &response);
                }
            }
            Verdict::DoneTcp(bytes) => {
                if let Some(handler) = self.finish(id) {
                    let response = Response::parse(&bytes)
                        .expect("matched response parses");
                    handler.on_received(self, id, &response);
                }
            }
            Verdict::Timeout => {
                if let Some(handler) = self.finish(id) {
                    handler.on_timeout(self, id);
                }
            }
            Verdict::Failed(err) => {
                if let Some(handler) = self.finish(id) {
                    handler.on_failure(self, id, err);
                }
            }
        }
    }

    /// Removes an operation from the arena and releases its resources.
    fn finish(&mut self, id: OpId) -> Option<Rc<dyn Handler>> {
        if !self.is_live(id) {
            return None;
        }
        let slot = self.ops.remove(id.index());
        Some(slot.op.retire(&mut *self.lp, &mut self.core))
    }
}

//--- Drop

impl Drop for Context {
    /// Graceful teardown: every outstanding operation is cancelled
    /// silently and all sockets are closed.
    fn drop(&mut self) {
        let keys: Vec<usize> = self.ops.iter().map(|(key, _)| key).collect();
        for key in keys {
            let slot = self.ops.remove(key);
            let _ = slot.op.retire(&mut *self.lp, &mut self.core);
        }
        self.pool.close(&mut *self.lp);
        if self.tick_armed {
            self.lp.cancel_timer(Token::pack(KIND_DELIVER, 0));
        }
    }
}
