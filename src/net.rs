//! Shared-port listener construction
//!
//! Every worker binds the same port. That requires `SO_REUSEPORT` (and
//! `SO_REUSEADDR`) set before the bind, which tokio's own builder does not
//! expose, so the socket is built with `socket2` and handed to tokio
//! afterward. The kernel then distributes incoming connections across the
//! workers' accept queues.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

/// Backlog length for the shared listener.
const LISTEN_BACKLOG: i32 = 1024;

/// Bind `addr` with port-sharing enabled and return a tokio listener.
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("failed to create socket")?;

    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .context("failed to set SO_REUSEPORT")?;

    socket
        .bind(&addr.into())
        .with_context(|| format!("failed to bind {}", addr))?;
    socket
        .listen(LISTEN_BACKLOG)
        .context("failed to listen")?;

    socket
        .set_nonblocking(true)
        .context("failed to set non-blocking")?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).context("failed to convert listener to tokio")
}
