//! The UDP socket pool.
//!
//! All operations share a small rotating set of long-lived unconnected
//! UDP sockets. Each pool slot lazily opens one socket per address
//! family on first use; a socket stays mono-family for its lifetime.
//! Outgoing queries round-robin over the slots so that source ports vary
//! and no single socket becomes a bottleneck.
//!
//! Receiving is decoupled from delivering: a readability event drains the
//! socket until it would block, parking every datagram in the socket's
//! FIFO queue. The core then pops datagrams within its per-tick callback
//! budget, so a burst of responses arriving in one event cannot starve
//! the host loop. [`UdpPool::buffered`] tells the core whether a backlog
//! remains that needs another tick.

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, trace};

use crate::event::{EventLoop, Token, KIND_UDP};

/// Kernel receive buffer size requested for pool sockets.
///
/// A pool socket serves many concurrent queries, so it gets more room
/// than a default socket would have.
const RECV_BUFFER: usize = 256 * 1024;

//------------ UdpPool -------------------------------------------------------

/// A rotating pool of UDP sockets.
#[derive(Debug)]
pub(crate) struct UdpPool {
    /// The pool slots.
    slots: Vec<Slot>,

    /// The slot the next send will use.
    current: usize,

    /// Size of the buffer a datagram is received into.
    recv_size: usize,
}

/// One pool slot, holding up to one socket per address family.
#[derive(Debug, Default)]
struct Slot {
    /// The IPv4 socket, opened on first IPv4 send through this slot.
    v4: Option<Sock>,

    /// The IPv6 socket, opened on first IPv6 send through this slot.
    v6: Option<Sock>,
}

/// A socket together with its inbound queue.
#[derive(Debug)]
struct Sock {
    /// The non-blocking socket.
    socket: UdpSocket,

    /// Datagrams received but not yet delivered, in arrival order.
    queue: VecDeque<(SocketAddr, Vec<u8>)>,

    /// Number of queries sent over this socket.
    sent: usize,
}

impl UdpPool {
    /// Creates a pool with `slots` slots.
    ///
    /// No sockets are opened yet; that happens on first send.
    pub fn new(slots: usize, recv_size: usize) -> Self {
        let slots = slots.max(1);
        UdpPool {
            slots: (0..slots).map(|_| Slot::default()).collect(),
            current: 0,
            recv_size,
        }
    }

    /// Sends a datagram to `target` over the next slot in rotation.
    ///
    /// The cursor advances regardless of the outcome. Errors, including
    /// a would-block from a full send buffer, are reported to the caller
    /// which treats them as a transient failure: the operation's timer
    /// keeps running and will trigger a retry.
    pub fn send(
        &mut self,
        lp: &mut dyn EventLoop,
        target: SocketAddr,
        payload: &[u8],
    ) -> io::Result<()> {
        let index = self.current;
        self.current = (self.current + 1) % self.slots.len();
        let recv_size = self.recv_size;
        let sock =
            self.slots[index].open(lp, index, target.is_ipv6(), recv_size)?;
        sock.sent += 1;
        let n = sock.socket.send_to(payload, target)?;
        if n != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "short datagram send",
            ));
        }
        Ok(())
    }

    /// Drains a readable socket into its inbound queue.
    ///
    /// Called from [`Context::on_readable`] with the token the pool
    /// registered for the socket. Datagrams whose source family does not
    /// match the socket's family are dropped here.
    ///
    /// [`Context::on_readable`]: crate::Context::on_readable
    pub fn receive(&mut self, token: Token) {
        let payload = token.payload();
        let index = (payload >> 1) as usize;
        let v6 = payload & 1 != 0;
        let recv_size = self.recv_size;
        let Some(slot) = self.slots.get_mut(index) else { return };
        let Some(sock) = (if v6 { slot.v6.as_mut() } else { slot.v4.as_mut() })
        else {
            return;
        };
        loop {
            let mut buf = vec![0u8; recv_size];
            match sock.socket.recv_from(&mut buf) {
                Ok((n, src)) => {
                    if src.is_ipv6() != v6 {
                        debug!(%src, "dropping datagram from wrong family");
                        continue;
                    }
                    buf.truncate(n);
                    sock.queue.push_back((src, buf));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    continue
                }
                Err(err) => {
                    // Asynchronous errors such as a connection-refused
                    // bounced back by the kernel. Nothing to deliver.
                    trace!(%err, "ignoring receive error");
                    break;
                }
            }
        }
    }

    /// Pops the oldest undelivered datagram, walking slots in order.
    pub fn pop(&mut self) -> Option<(SocketAddr, Vec<u8>)> {
        for slot in &mut self.slots {
            for sock in [slot.v4.as_mut(), slot.v6.as_mut()]
                .into_iter()
                .flatten()
            {
                if let Some(item) = sock.queue.pop_front() {
                    return Some(item);
                }
            }
        }
        None
    }

    /// Returns whether any socket still has undelivered datagrams.
    pub fn buffered(&self) -> bool {
        self.slots.iter().any(|slot| {
            [slot.v4.as_ref(), slot.v6.as_ref()]
                .into_iter()
                .flatten()
                .any(|sock| !sock.queue.is_empty())
        })
    }

    /// Closes all sockets and drops their registrations.
    pub fn close(&mut self, lp: &mut dyn EventLoop) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.v4.take().is_some() {
                lp.cancel_reader(udp_token(index, false));
            }
            if slot.v6.take().is_some() {
                lp.cancel_reader(udp_token(index, true));
            }
        }
    }

    /// Returns how many sends each slot has carried so far.
    #[cfg(test)]
    fn sends_per_slot(&self) -> Vec<usize> {
        self.slots
            .iter()
            .map(|slot| {
                slot.v4.as_ref().map_or(0, |sock| sock.sent)
                    + slot.v6.as_ref().map_or(0, |sock| sock.sent)
            })
            .collect()
    }
}

impl Slot {
    /// Returns the slot's socket for a family, opening it if necessary.
    fn open(
        &mut self,
        lp: &mut dyn EventLoop,
        index: usize,
        v6: bool,
        recv_size: usize,
    ) -> io::Result<&mut Sock> {
        let entry = if v6 { &mut self.v6 } else { &mut self.v4 };
        if entry.is_none() {
            let socket = open_socket(v6, recv_size)?;
            lp.add_reader(socket.as_raw_fd(), udp_token(index, v6));
            *entry = Some(Sock {
                socket,
                queue: VecDeque::new(),
                sent: 0,
            });
        }
        Ok(entry.as_mut().expect("just opened"))
    }
}

/// Opens a non-blocking UDP socket bound to an ephemeral port.
fn open_socket(v6: bool, recv_size: usize) -> io::Result<UdpSocket> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(RECV_BUFFER.max(recv_size))?;
    let bind_addr: SocketAddr = if v6 {
        "[::]:0".parse().expect("literal address")
    } else {
        "0.0.0.0:0".parse().expect("literal address")
    };
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}

/// Builds the reader token for a slot socket.
fn udp_token(index: usize, v6: bool) -> Token {
    Token::pack(KIND_UDP, (index as u64) << 1 | u64::from(v6))
}

//============ Testing ======================================================
