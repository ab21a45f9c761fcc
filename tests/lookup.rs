//! End-to-end tests of the query lifecycle.
//!
//! The host loop is a recording mock driven explicitly by the tests, the
//! nameservers are plain sockets on the loopback interface, so every
//! scenario, retries, truncation upgrades, search-path walks, spoofed
//! replies, runs deterministically: timers only fire when a test fires
//! them.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use dnstub::base::header::{HeaderMut, Opcode};
use dnstub::{
    Config, Context, Error, EventLoop, Handler, Ip, Nameserver, OpId,
    Response, Section, Token,
};

//------------ Mock event loop -----------------------------------------------

#[derive(Default)]
struct LoopState {
    timers: Vec<(Duration, Token)>,
    readers: Vec<(Token, RawFd)>,
    writers: Vec<(Token, RawFd)>,
}

/// A recording event loop shared between the context and the test.
#[derive(Clone, Default)]
struct MockLoop {
    state: Rc<RefCell<LoopState>>,
}

impl EventLoop for MockLoop {
    fn add_timer(&mut self, delay: Duration, token: Token) {
        self.state.borrow_mut().timers.push((delay, token));
    }

    fn cancel_timer(&mut self, token: Token) {
        self.state.borrow_mut().timers.retain(|&(_, t)| t != token);
    }

    fn add_reader(&mut self, fd: RawFd, token: Token) {
        self.state.borrow_mut().readers.push((token, fd));
    }

    fn cancel_reader(&mut self, token: Token) {
        self.state.borrow_mut().readers.retain(|&(t, _)| t != token);
    }

    fn add_writer(&mut self, fd: RawFd, token: Token) {
        self.state.borrow_mut().writers.push((token, fd));
    }

    fn cancel_writer(&mut self, token: Token) {
        self.state.borrow_mut().writers.retain(|&(t, _)| t != token);
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl MockLoop {
    /// Reports every registered reader and writer as ready and fires any
    /// armed zero-delay timers.
    fn pump_once(&self, ctx: &mut Context) {
        let readers: Vec<Token> =
            self.state.borrow().readers.iter().map(|&(t, _)| t).collect();
        for token in readers {
            ctx.on_readable(token);
        }
        let writers: Vec<Token> =
            self.state.borrow().writers.iter().map(|&(t, _)| t).collect();
        for token in writers {
            ctx.on_writable(token);
        }
        let ticks: Vec<Token> = self
            .state
            .borrow()
            .timers
            .iter()
            .filter(|(delay, _)| delay.is_zero())
            .map(|&(_, t)| t)
            .collect();
        for token in ticks {
            self.state.borrow_mut().timers.retain(|&(_, t)| t != token);
            ctx.on_timer(token);
        }
    }

    /// Pumps until `done` or a three second deadline.
    fn pump_until(&self, ctx: &mut Context, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !done() {
            assert!(Instant::now() < deadline, "test deadline passed");
            self.pump_once(ctx);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Pumps for a fixed little while, for asserting that nothing happens.
    fn pump_for(&self, ctx: &mut Context, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            self.pump_once(ctx);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Fires the next armed attempt timer (ignoring delivery ticks).
    fn fire_timer(&self, ctx: &mut Context) {
        let token = self
            .state
            .borrow()
            .timers
            .iter()
            .find(|(delay, _)| !delay.is_zero())
            .map(|&(_, t)| t)
            .expect("an attempt timer should be armed");
        self.state.borrow_mut().timers.retain(|&(_, t)| t != token);
        ctx.on_timer(token);
    }

    /// Returns the number of armed timers, delivery ticks included.
    fn armed_timers(&self) -> usize {
        self.state.borrow().timers.len()
    }
}

//------------ Recording handler ---------------------------------------------

#[derive(Debug)]
enum Event {
    Received(Vec<(u16, Vec<u8>)>),
    Timeout,
    Failed(Error),
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<Event>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.events.borrow().len()
    }

    fn answers(&self, index: usize) -> Vec<(u16, Vec<u8>)> {
        match &self.events.borrow()[index] {
            Event::Received(answers) => answers.clone(),
            other => panic!("expected answers, got {:?}", other),
        }
    }
}

impl Handler for Recorder {
    fn on_received(&self, _: &mut Context, _: OpId, response: &Response) {
        let answers = response
            .records(Section::Answer)
            .expect("answer section parses")
            .map(|record| {
                let record = record.expect("record parses");
                (record.rtype(), record.rdata().to_vec())
            })
            .collect();
        self.events.borrow_mut().push(Event::Received(answers));
    }

    fn on_timeout(&self, _: &mut Context, _: OpId) {
        self.events.borrow_mut().push(Event::Timeout);
    }

    fn on_failure(&self, _: &mut Context, _: OpId, error: Error) {
        self.events.borrow_mut().push(Event::Failed(error));
    }
}

//------------ Fake nameserver -----------------------------------------------

struct DnsServer {
    sock: UdpSocket,
}

impl DnsServer {
    fn bind() -> Self {
        let sock = UdpSocket::bind("127.0.0.1:0").expect("bind loopback");
        sock.set_nonblocking(true).unwrap();
        DnsServer { sock }
    }

    fn nameserver(&self) -> Nameserver {
        Nameserver::with_port(
            Ip::loopback(4),
            self.sock.local_addr().unwrap().port(),
        )
    }

    fn try_recv(&self) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 4096];
        match self.sock.recv_from(&mut buf) {
            Ok((n, src)) => {
                buf.truncate(n);
                Some((buf, src))
            }
            Err(_) => None,
        }
    }

    /// Receives the next query, pumping the context while waiting.
    fn recv(
        &self,
        ctx: &mut Context,
        lp: &MockLoop,
    ) -> (Vec<u8>, SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(3);
        loop {
            if let Some(got) = self.try_recv() {
                return got;
            }
            assert!(Instant::now() < deadline, "no query arrived");
            lp.pump_once(ctx);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn send(&self, to: SocketAddr, bytes: &[u8]) {
        self.sock.send_to(bytes, to).expect("send reply");
    }
}

//------------ Wire crafting -------------------------------------------------

/// Returns the offset just past the (single, uncompressed) question.
fn question_end(msg: &[u8]) -> usize {
    let mut pos = 12;
    while msg[pos] != 0 {
        pos += 1 + msg[pos] as usize;
    }
    pos + 1 + 4
}

/// Truncates a query to header plus question and zeroes the counts.
fn strip(query: &[u8]) -> Vec<u8> {
    let mut buf = query[..question_end(query)].to_vec();
    let mut header = HeaderMut::for_message_slice(&mut buf);
    header.set_qr(true);
    header.set_ancount(0);
    header.set_arcount(0);
    buf
}

/// A response carrying one A record.
fn reply_a(query: &[u8], addr: [u8; 4]) -> Vec<u8> {
    let mut buf = strip(query);
    HeaderMut::for_message_slice(&mut buf).set_ancount(1);
    buf.extend_from_slice(&[
        0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2c, 0x00,
        0x04,
    ]);
    buf.extend_from_slice(&addr);
    buf
}

/// An NXDOMAIN response.
fn reply_nxdomain(query: &[u8]) -> Vec<u8> {
    let mut buf = strip(query);
    HeaderMut::for_message_slice(&mut buf).set_rcode(3);
    buf
}

/// A truncated response.
fn reply_truncated(query: &[u8]) -> Vec<u8> {
    let mut buf = strip(query);
    HeaderMut::for_message_slice(&mut buf).set_tc(true);
    buf
}

/// The question name of a query.
fn qname(query: &[u8]) -> String {
    Response::parse(query)
        .unwrap()
        .questions()
        .next()
        .unwrap()
        .unwrap()
        .name()
        .to_string()
}

//------------ Setup ---------------------------------------------------------

fn context_for(server: &DnsServer) -> (Context, MockLoop, Rc<Recorder>) {
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    context_with(conf)
}

fn context_with(conf: Config) -> (Context, MockLoop, Rc<Recorder>) {
    let lp = MockLoop::default();
    let ctx = Context::new(Box::new(lp.clone()), conf);
    (ctx, lp, Rc::new(Recorder::default()))
}

//------------ Scenarios -----------------------------------------------------

#[test]
fn happy_path() {
    let server = DnsServer::bind();
    let (mut ctx, lp, rec) = context_for(&server);

    ctx.query("example.com", 1, rec.clone()).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);
    server.send(from, &reply_a(&query, [93, 184, 216, 34]));

    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert_eq!(rec.answers(0), vec![(1, vec![93, 184, 216, 34])]);
    assert_eq!(ctx.outstanding(), 0);
    assert_eq!(lp.armed_timers(), 0, "no timer may stay armed");
    assert!(ctx.last_rtt(Ip::loopback(4)).is_some());
}

#[test]
fn retry_after_timeout() {
    let server = DnsServer::bind();
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    conf.attempts = 2;
    let (mut ctx, lp, rec) = context_with(conf);

    ctx.query("example.com", 1, rec.clone()).unwrap();

    // Swallow the first datagram, answer the second.
    let (first, _) = server.recv(&mut ctx, &lp);
    lp.fire_timer(&mut ctx);
    let (second, from) = server.recv(&mut ctx, &lp);
    assert_eq!(first, second, "retries re-send the query verbatim");
    server.send(from, &reply_a(&second, [93, 184, 216, 34]));

    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert_eq!(rec.answers(0), vec![(1, vec![93, 184, 216, 34])]);
    assert!(server.try_recv().is_none(), "exactly two datagrams sent");
}

#[test]
fn timeout_surfaces_after_exhaustion() {
    let server = DnsServer::bind();
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    conf.attempts = 1;
    let (mut ctx, lp, rec) = context_with(conf);

    ctx.query("example.com", 1, rec.clone()).unwrap();
    let _ = server.recv(&mut ctx, &lp);
    lp.fire_timer(&mut ctx);

    assert_eq!(rec.count(), 1);
    assert!(matches!(rec.events.borrow()[0], Event::Timeout));
    assert_eq!(ctx.outstanding(), 0);
}

#[test]
fn truncation_upgrades_to_tcp() {
    let server = DnsServer::bind();
    let listener = TcpListener::bind((
        "127.0.0.1",
        server.sock.local_addr().unwrap().port(),
    ))
    .expect("tcp listener on the nameserver port");
    listener.set_nonblocking(true).unwrap();

    let (mut ctx, lp, rec) = context_for(&server);
    ctx.query("example.com", 1, rec.clone()).unwrap();

    let (query, from) = server.recv(&mut ctx, &lp);
    server.send(from, &reply_truncated(&query));

    // The truncated reply makes the operation connect to the same server
    // over TCP.
    let mut stream = accept_pumped(&listener, &mut ctx, &lp);
    let request = read_frame(&mut stream, &mut ctx, &lp);
    assert_eq!(request, query, "tcp re-sends the same query");

    let reply = reply_a(&query, [93, 184, 216, 34]);
    let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
    framed.extend_from_slice(&reply);
    stream.write_all(&framed).unwrap();

    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert_eq!(rec.answers(0), vec![(1, vec![93, 184, 216, 34])]);
    assert_eq!(ctx.outstanding(), 0);
}

#[test]
fn search_path_walks_suffixes() {
    let server = DnsServer::bind();
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    conf.ndots = 2;
    conf.search = vec!["corp.".into(), "example.".into()];
    let (mut ctx, lp, rec) = context_with(conf);

    ctx.query("foo", 1, rec.clone()).unwrap();

    let (first, from) = server.recv(&mut ctx, &lp);
    assert_eq!(qname(&first), "foo.corp");
    server.send(from, &reply_nxdomain(&first));

    let (second, from) = server.recv(&mut ctx, &lp);
    assert_eq!(qname(&second), "foo.example");
    assert_ne!(
        Response::parse(&first).unwrap().id(),
        Response::parse(&second).unwrap().id(),
        "every candidate gets a fresh transaction id"
    );
    server.send(from, &reply_a(&second, [192, 0, 2, 7]));

    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert_eq!(rec.answers(0), vec![(1, vec![192, 0, 2, 7])]);
}

#[test]
fn last_suffix_nxdomain_surfaces() {
    let server = DnsServer::bind();
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    conf.ndots = 2;
    conf.search = vec!["corp.".into()];
    let (mut ctx, lp, rec) = context_with(conf);

    ctx.query("foo", 1, rec.clone()).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);
    server.send(from, &reply_nxdomain(&query));

    lp.pump_until(&mut ctx, || rec.count() > 0);
    let events = rec.events.borrow();
    match &events[0] {
        Event::Received(answers) => assert!(answers.is_empty()),
        other => panic!("expected the nxdomain answer, got {:?}", other),
    }
}

#[test]
fn cancel_suppresses_the_callback() {
    let server = DnsServer::bind();
    let (mut ctx, lp, rec) = context_for(&server);

    let op = ctx.query("example.com", 1, rec.clone()).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);

    ctx.cancel(op);
    ctx.cancel(op); // idempotent
    assert_eq!(ctx.outstanding(), 0);
    assert_eq!(lp.armed_timers(), 0);

    server.send(from, &reply_a(&query, [93, 184, 216, 34]));
    lp.pump_for(&mut ctx, Duration::from_millis(50));
    assert_eq!(rec.count(), 0, "cancelled operations stay silent");
}

#[test]
fn reply_from_unexpected_source_is_dropped() {
    let server = DnsServer::bind();
    let (mut ctx, lp, rec) = context_for(&server);

    ctx.query("example.com", 1, rec.clone()).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);

    // Correct id, correct question, wrong source port.
    let spoofer = UdpSocket::bind("127.0.0.1:0").unwrap();
    spoofer
        .send_to(&reply_a(&query, [6, 6, 6, 6]), from)
        .unwrap();
    lp.pump_for(&mut ctx, Duration::from_millis(50));
    assert_eq!(rec.count(), 0, "spoofed reply must be dropped");
    assert_eq!(ctx.outstanding(), 1, "operation keeps waiting");

    server.send(from, &reply_a(&query, [93, 184, 216, 34]));
    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert_eq!(rec.answers(0), vec![(1, vec![93, 184, 216, 34])]);
}

#[test]
fn unknown_transaction_id_is_dropped() {
    let server = DnsServer::bind();
    let (mut ctx, lp, rec) = context_for(&server);

    ctx.query("example.com", 1, rec.clone()).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);

    let mut wrong = reply_a(&query, [6, 6, 6, 6]);
    let id = Response::parse(&query).unwrap().id();
    HeaderMut::for_message_slice(&mut wrong).set_id(id.wrapping_add(1));
    server.send(from, &wrong);
    lp.pump_for(&mut ctx, Duration::from_millis(50));
    assert_eq!(rec.count(), 0);

    server.send(from, &reply_a(&query, [93, 184, 216, 34]));
    lp.pump_until(&mut ctx, || rec.count() > 0);
}

#[test]
fn delivery_budget_defers_to_the_next_tick() {
    let server = DnsServer::bind();
    let mut conf = Config::new();
    conf.nameservers = vec![server.nameserver()];
    conf.budget = 1;
    let (mut ctx, lp, rec) = context_with(conf);

    ctx.query("one.example", 1, rec.clone()).unwrap();
    ctx.query("two.example", 1, rec.clone()).unwrap();
    let (q1, from) = server.recv(&mut ctx, &lp);
    let (q2, _) = server.recv(&mut ctx, &lp);
    server.send(from, &reply_a(&q1, [192, 0, 2, 1]));
    server.send(from, &reply_a(&q2, [192, 0, 2, 2]));
    std::thread::sleep(Duration::from_millis(50));

    // One readability event, both replies queued, budget one: a single
    // callback runs and a zero-delay tick is armed for the rest.
    let reader = lp.state.borrow().readers[0].0;
    ctx.on_readable(reader);
    assert_eq!(rec.count(), 1);
    assert!(ctx.buffered());
    let tick = lp
        .state
        .borrow()
        .timers
        .iter()
        .find(|(delay, _)| delay.is_zero())
        .map(|&(_, t)| t)
        .expect("delivery tick armed");

    lp.state.borrow_mut().timers.retain(|&(_, t)| t != tick);
    ctx.on_timer(tick);
    assert_eq!(rec.count(), 2);
    assert!(!ctx.buffered());
    assert_eq!(ctx.outstanding(), 0);
}

#[test]
fn notify_goes_to_the_given_server() {
    let server = DnsServer::bind();
    let (mut ctx, lp, rec) = context_for(&server);

    ctx.notify(server.nameserver(), "example.com", rec.clone())
        .unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);
    let parsed = Response::parse(&query).unwrap();
    assert_eq!(parsed.opcode(), Opcode::Notify);
    let question = parsed.questions().next().unwrap().unwrap();
    assert_eq!(question.name(), "example.com");
    assert_eq!(question.qtype(), 6); // SOA

    server.send(from, &strip(&query));
    lp.pump_until(&mut ctx, || rec.count() > 0);
    assert!(matches!(rec.events.borrow()[0], Event::Received(_)));
}

#[test]
fn cancelling_from_inside_a_callback_is_safe() {
    use std::cell::Cell;

    struct CancelSelf {
        done: Rc<Cell<bool>>,
    }

    impl Handler for CancelSelf {
        fn on_received(&self, ctx: &mut Context, op: OpId, _: &Response) {
            // The operation is already finished; both cancels are inert.
            ctx.cancel(op);
            ctx.cancel(op);
            self.done.set(true);
        }
        fn on_timeout(&self, _: &mut Context, _: OpId) {}
        fn on_failure(&self, _: &mut Context, _: OpId, _: Error) {}
    }

    let server = DnsServer::bind();
    let (mut ctx, lp, _) = context_for(&server);
    let done = Rc::new(Cell::new(false));
    let handler = Rc::new(CancelSelf { done: done.clone() });
    ctx.query("example.com", 1, handler).unwrap();
    let (query, from) = server.recv(&mut ctx, &lp);
    server.send(from, &reply_a(&query, [93, 184, 216, 34]));
    lp.pump_until(&mut ctx, || done.get());
    assert_eq!(ctx.outstanding(), 0);
}

//------------ TCP helpers ---------------------------------------------------

/// Accepts the pending connection, pumping the context while waiting.
fn accept_pumped(
    listener: &TcpListener,
    ctx: &mut Context,
    lp: &MockLoop,
) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        lp.pump_once(ctx);
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true).unwrap();
                return stream;
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("accept failed: {err}"),
        }
        assert!(Instant::now() < deadline, "no tcp connection arrived");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Reads one length-prefixed message, pumping the context while waiting.
fn read_frame(
    stream: &mut TcpStream,
    ctx: &mut Context,
    lp: &MockLoop,
) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut buf = Vec::new();
    let mut need = 2usize;
    let mut have_len = false;
    loop {
        let mut chunk = vec![0u8; need - buf.len()];
        match stream.read(&mut chunk) {
            Ok(0) => panic!("connection closed early"),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                lp.pump_once(ctx);
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(err) => panic!("read failed: {err}"),
        }
        if !have_len && buf.len() == 2 {
            need = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
            buf.clear();
            have_len = true;
        }
        if have_len && buf.len() == need {
            return buf;
        }
        assert!(Instant::now() < deadline, "no frame arrived");
    }
}
