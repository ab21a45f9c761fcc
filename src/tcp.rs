//! The TCP connector.
//!
//! When a UDP reply comes back truncated, the operation re-asks the same
//! server over TCP. The connection is strictly one-shot: connect, write
//! the query behind a two octet length prefix, read one length-prefixed
//! reply, close (RFC 7766). Connection reuse and pipelining are server
//! optimizations a stub retrying a single truncated answer does not
//! need.
//!
//! Everything is non-blocking. The owning operation drives the
//! connection through readiness callbacks and owns the timeout; this
//! module only moves bytes.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::trace;

use crate::event::{EventLoop, Token};

//------------ TcpConn -------------------------------------------------------

/// A one-shot TCP connection to a nameserver.
#[derive(Debug)]
pub(crate) struct TcpConn {
    /// The non-blocking stream.
    stream: TcpStream,

    /// The token both readiness registrations carry.
    token: Token,

    /// Where we are in the exchange.
    state: State,

    /// The length-prefixed query.
    wr: Vec<u8>,

    /// How much of the query has been written.
    wr_pos: usize,

    /// What we are currently reading.
    rd: ReadItem,

    /// How much of the current read item has been filled.
    rd_pos: usize,
}

/// The phases of the exchange.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// The non-blocking connect has not completed yet.
    Connecting,

    /// Connected, still writing the query.
    Sending,

    /// Query written, reading the reply.
    Receiving,
}

/// An item to read: the size shim or the message behind it.
///
/// Reading alternates between the two: once the two size octets are in,
/// they determine the message buffer to fill next.
#[derive(Debug)]
enum ReadItem {
    /// The size shim preceding the message.
    Size([u8; 2]),

    /// The actual message.
    Message(Vec<u8>),
}

impl ReadItem {
    /// Returns the buffer of the current item.
    fn buf(&mut self) -> &mut [u8] {
        match self {
            ReadItem::Size(data) => data,
            ReadItem::Message(data) => data,
        }
    }
}

impl TcpConn {
    /// Starts a connection to `target` that will carry `query`.
    ///
    /// Registers the stream for both readability and writability under
    /// `token`. The connect itself completes asynchronously; progress
    /// happens in [`on_writable`].
    ///
    /// [`on_writable`]: Self::on_writable
    pub fn connect(
        lp: &mut dyn EventLoop,
        target: SocketAddr,
        query: &[u8],
        token: Token,
    ) -> io::Result<Self> {
        let domain = if target.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&target.into()) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(err),
        }
        let stream: TcpStream = socket.into();

        let mut wr = Vec::with_capacity(query.len() + 2);
        wr.extend_from_slice(&(query.len() as u16).to_be_bytes());
        wr.extend_from_slice(query);

        lp.add_writer(stream.as_raw_fd(), token);
        lp.add_reader(stream.as_raw_fd(), token);
        Ok(TcpConn {
            stream,
            token,
            state: State::Connecting,
            wr,
            wr_pos: 0,
            rd: ReadItem::Size([0; 2]),
            rd_pos: 0,
        })
    }

    /// Advances the connect and send phases.
    ///
    /// Once the query is fully written the writability registration is
    /// dropped; everything further happens on readability.
    pub fn on_writable(
        &mut self,
        lp: &mut dyn EventLoop,
    ) -> io::Result<()> {
        if self.state == State::Connecting {
            // Writability after a non-blocking connect means the connect
            // finished; the outcome is in SO_ERROR.
            if let Some(err) = self.stream.take_error()? {
                return Err(err);
            }
            self.state = State::Sending;
        }
        if self.state != State::Sending {
            return Ok(());
        }
        while self.wr_pos < self.wr.len() {
            match (&self.stream).write(&self.wr[self.wr_pos..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "zero-length write",
                    ))
                }
                Ok(n) => self.wr_pos += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(())
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == io::ErrorKind::NotConnected => {
                    // Writability can be reported while the connect is
                    // still pending; wait for the next event.
                    self.state = State::Connecting;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
        trace!("query sent over tcp");
        lp.cancel_writer(self.token);
        self.state = State::Receiving;
        Ok(())
    }

    /// Reads whatever is available.
    ///
    /// Returns the complete reply once the full message is in, `None`
    /// while more octets are pending.
    pub fn on_readable(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.state == State::Connecting {
            return Ok(None);
        }
        loop {
            let pos = self.rd_pos;
            let buf = self.rd.buf();
            if pos == buf.len() {
                // Only a zero-length message lands here; reject below.
            } else {
                match (&self.stream).read(&mut buf[pos..]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-message",
                        ))
                    }
                    Ok(n) => {
                        self.rd_pos += n;
                        if self.rd_pos < buf.len() {
                            continue;
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock =>
                    {
                        return Ok(None)
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::Interrupted =>
                    {
                        continue
                    }
                    Err(err) => return Err(err),
                }
            }
            // The current item is complete.
            self.rd_pos = 0;
            match std::mem::replace(&mut self.rd, ReadItem::Size([0; 2])) {
                ReadItem::Size(data) => {
                    let size = usize::from(u16::from_be_bytes(data));
                    if size == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "zero-length message",
                        ));
                    }
                    self.rd = ReadItem::Message(vec![0; size]);
                }
                ReadItem::Message(data) => return Ok(Some(data)),
            }
        }
    }

    /// Tears the connection down, dropping both registrations.
    pub fn close(self, lp: &mut dyn EventLoop) {
        lp.cancel_writer(self.token);
        lp.cancel_reader(self.token);
    }
}

//============ Testing ======================================================
