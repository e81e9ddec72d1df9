use std::{
    future::Future,
    io,
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Idle time before keep-alive probes start on accepted connections.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// The transport under a [`GracefulListener`](crate::GracefulListener).
///
/// Dropping the listener closes it; `stop` gives a transport the chance to report an error from
/// doing so.
pub trait Listener: Send + Sync + 'static {
    type Conn: Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Build a handle that can tear `conn` down from another task while the caller keeps using it.
    fn severer(conn: &Self::Conn) -> io::Result<Severer>;

    fn stop(&self) -> io::Result<()> {
        Ok(())
    }

    fn descriptor(&self) -> Option<RawFd> {
        None
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// One-shot force-close for a connection owned by someone else.
pub struct Severer(Box<dyn FnOnce() + Send>);

impl Severer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub(crate) fn sever(self) {
        (self.0)()
    }
}

impl std::fmt::Debug for Severer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Severer")
    }
}

impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let (stream, _peer) = TcpListener::accept(self).await?;
        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        Ok(stream)
    }

    fn severer(conn: &TcpStream) -> io::Result<Severer> {
        // shutdown(2) on a dup reaches the shared socket, so the owner's reads see EOF and its
        // writes fail, without racing the owner's own close of its descriptor.
        let dup = SockRef::from(conn).try_clone()?;
        Ok(Severer::new(move || {
            let _ = dup.shutdown(Shutdown::Both);
        }))
    }

    fn descriptor(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpListener::local_addr(self).ok()
    }
}
