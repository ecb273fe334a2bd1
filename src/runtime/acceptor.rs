//! Connection acceptor.
//!
//! Runs on its own thread. Readiness of the listening socket is polled
//! with mio together with a waker, so shutdown interrupts a pending
//! accept immediately instead of waiting for the next client.

use crate::runtime::op::PendingOp;
use crate::runtime::uring::event_loop::submit_or_retire;
use crate::server::ServerContext;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

pub struct Acceptor {
    poll: Poll,
    listener: TcpListener,
}

impl Acceptor {
    /// Wrap a bound, listening, non-blocking socket.
    ///
    /// Returns the acceptor and the waker that interrupts its poll.
    pub fn new(listener: std::net::TcpListener) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok((Self { poll, listener }, waker))
    }

    /// Accept connections until the context's shutdown flag is set.
    pub fn run(mut self, ctx: &ServerContext) {
        let mut events = Events::with_capacity(64);
        info!("Acceptor started");

        while !ctx.is_shutting_down() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Acceptor poll failed");
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER_TOKEN {
                    self.accept_pending(ctx);
                }
            }
        }

        info!("Acceptor stopped");
    }

    fn accept_pending(&self, ctx: &ServerContext) {
        while !ctx.is_shutting_down() {
            match self.listener.accept() {
                Ok((stream, peer)) => bootstrap(ctx, stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Dropped connection before accept");
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    break;
                }
            }
        }
    }
}

/// Register a new connection and submit its first read.
fn bootstrap(ctx: &ServerContext, stream: TcpStream, peer: SocketAddr) {
    // SAFETY: the fd was just released by `into_raw_fd`, so it has one owner.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };

    let conn = match ctx.registry.register(stream, peer) {
        Some(conn) => conn,
        None => {
            warn!(peer = %peer, "Connection limit reached, closing");
            return;
        }
    };

    debug!(conn_id = conn.id(), peer = %peer, "Accepted connection");

    let op = PendingOp::read(conn, ctx.buffer_size, &ctx.ledger);
    submit_or_retire(&ctx.queue, op);
}

/// Errors that concern only the connection being accepted. Anything else
/// (descriptor or memory exhaustion) would fail again on the next accept.
fn is_connection_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset => true,
        _ => matches!(
            e.raw_os_error(),
            Some(
                libc::EPROTO
                    | libc::EPERM
                    | libc::ENETDOWN
                    | libc::ENETUNREACH
                    | libc::EHOSTUNREACH
            )
        ),
    }
}
