// Copyright (c) 2025 The Triptych developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The three server engines and their shared plumbing.
//!
//! Each engine consumes the same router and exposes the same trait, so
//! the benchmark harness and the tests drive them interchangeably. The
//! engines differ in where the parse → route → respond steps execute:
//! a worker thread, a future chain across pools, or a reactor loop.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::metrics::ServerMetrics;
use crate::response::Response;
use crate::wire;

pub mod event_loop;
pub mod hybrid;
pub mod threaded;

pub use self::event_loop::EventLoopServer;
pub use self::hybrid::HybridServer;
pub use self::threaded::ThreadedServer;

/// The face all three engines share.
pub trait Engine: Send {
    /// Short identifier used in logs and benchmark records.
    fn name(&self) -> &'static str;

    /// Where the engine is listening.
    fn local_addr(&self) -> SocketAddr;

    /// The engine's counters.
    fn metrics(&self) -> Arc<ServerMetrics>;

    /// Stops accepting, drains and joins everything the engine spawned.
    /// Idempotent.
    fn shutdown(&mut self);
}

/// Binds a listener with an explicit backlog, in blocking mode.
pub(crate) fn bind_listener(port: u16, backlog: u32) -> io::Result<std::net::TcpListener> {
    let address: SocketAddr = ([0, 0, 0, 0], port).into();
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(backlog as i32)?;
    Ok(socket.into())
}

/// Applies the per-connection socket policy: TCP_NODELAY, SO_KEEPALIVE
/// and, where the engine reads blockingly, the read timeout.
pub(crate) fn tune_stream(stream: &TcpStream, read_timeout: Option<Duration>)
                          -> io::Result<()>
{
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    stream.set_read_timeout(read_timeout)?;
    Ok(())
}

/// The address a local client can reach the listener at. Engines bind
/// the wildcard address; connecting back (for accept wakeups and tests)
/// goes through loopback.
pub(crate) fn loopback_addr(bound: SocketAddr) -> SocketAddr {
    ([127, 0, 0, 1], bound.port()).into()
}

/// True for errors that mean the peer went away mid-conversation.
pub(crate) fn is_peer_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Best-effort error response on a still-blocking socket. Failures are
/// expected (the peer may already be gone) and only logged.
pub(crate) fn write_error_response<W>(out: &mut W, status_code: u16)
    where W: Write
{
    let mut response = Response::from_status(status_code);
    if let Err(err) = wire::write_response(out, &mut response) {
        if !is_peer_disconnect(&err) {
            warn!("failed to write {} response: {}", status_code, err);
        }
    }
}
