//! Listeners that can stop accepting and drain, with a bounded grace period.
//!
//! Every connection accepted through a [`GracefulListener`] holds a ticket on the listener's
//! [`WaitGroup`]. [`GracefulListener::release`] stops accepting and arms a deadline; connections
//! still open when it fires are severed by their watcher task. [`GracefulListener::close`] waits
//! for the count to reach zero.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::Notify,
};
use tokio_util::sync::CancellationToken;

use crate::listener::Listener;

/// Counter of outstanding work with an awaitable "reached zero" edge.
#[derive(Clone, Default)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

#[derive(Default)]
struct WaitGroupInner {
    count: AtomicUsize,
    zero: Notify,
}

/// Decrements its [`WaitGroup`] on drop.
pub struct Ticket {
    inner: Arc<WaitGroupInner>,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.zero.notify_waiters();
        }
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self) -> Ticket {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        Ticket {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.zero.notified();
            tokio::pin!(notified);
            // register before reading the counter, or a drop in between is lost
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listener released")
}

pub struct GracefulListener<L: Listener> {
    inner: Mutex<Option<Arc<L>>>,
    local_addr: Option<SocketAddr>,
    connections: WaitGroup,
    stop_accepting: CancellationToken,
    force_close: CancellationToken,
    released: AtomicBool,
    stop_error: Mutex<Option<io::Error>>,
    forced: Arc<AtomicUsize>,
}

impl<L: Listener> GracefulListener<L> {
    pub fn new(listener: L) -> Self {
        let local_addr = listener.local_addr();
        Self {
            inner: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            connections: WaitGroup::new(),
            stop_accepting: CancellationToken::new(),
            force_close: CancellationToken::new(),
            released: AtomicBool::new(false),
            stop_error: Mutex::new(None),
            forced: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept the next connection. Fails with [`io::ErrorKind::NotConnected`] once released,
    /// including for callers already parked in `accept`.
    pub async fn accept(&self) -> io::Result<GracefulConn<L::Conn>> {
        let listener = self.inner.lock().clone().ok_or_else(released)?;

        let conn = tokio::select! {
            biased;
            _ = self.stop_accepting.cancelled() => return Err(released()),
            res = listener.accept() => res?,
        };
        drop(listener);

        let severer = L::severer(&conn)?;
        let ticket = Arc::new(Mutex::new(Some(self.connections.add())));
        let closed = CancellationToken::new();

        let force_close = self.force_close.clone();
        let conn_closed = closed.clone();
        let forced = self.forced.clone();
        let conn_ticket = ticket.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = force_close.cancelled() => {
                    // whoever takes the ticket first is the one that counts the connection out
                    let Some(ticket) = conn_ticket.lock().take() else {
                        return;
                    };
                    forced.fetch_add(1, Ordering::AcqRel);
                    severer.sever();
                    drop(ticket);
                }
                _ = conn_closed.cancelled() => (),
            }
        });

        Ok(GracefulConn {
            inner: Some(conn),
            ticket,
            closed,
        })
    }

    /// Stop accepting and start the drain clock. Returns immediately.
    ///
    /// Connections still open after `timeout` are force-closed. Only the first call has any
    /// effect.
    pub fn release(&self, timeout: Duration) {
        if self.released.swap(true, Ordering::AcqRel) {
            log::warn!("listener {:?} already released", self.local_addr);
            return;
        }

        if let Some(listener) = self.inner.lock().take() {
            if let Err(e) = listener.stop() {
                *self.stop_error.lock() = Some(e);
            }
        }
        self.stop_accepting.cancel();

        let connections = self.connections.clone();
        let force_close = self.force_close.clone();
        let addr = self.local_addr;
        tokio::spawn(async move {
            tokio::select! {
                _ = connections.wait() => {
                    log::debug!("listener {addr:?} drained");
                }
                _ = tokio::time::sleep(timeout) => {
                    log::warn!(
                        "listener {addr:?}: {} connections still open after {timeout:?}, closing them",
                        connections.count()
                    );
                    force_close.cancel();
                }
            }
        });
    }

    /// Wait until every accepted connection has closed, then report any error from stopping the
    /// listener.
    pub async fn close(&self) -> io::Result<()> {
        self.connections.wait().await;
        match self.stop_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        self.connections.count()
    }

    /// Connections severed by the drain deadline so far.
    pub fn forced_closures(&self) -> usize {
        self.forced.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// A connection accepted through a [`GracefulListener`].
///
/// Closing (explicitly or by drop) releases the underlying connection and its drain ticket. A
/// connection severed by the drain deadline has already given its ticket back; closing it then
/// only drops the socket.
pub struct GracefulConn<C> {
    inner: Option<C>,
    ticket: Arc<Mutex<Option<Ticket>>>,
    closed: CancellationToken,
}

impl<C> GracefulConn<C> {
    /// Close the connection. Later calls do nothing.
    pub fn close(&mut self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.inner = None;
        self.closed.cancel();
        let ticket = self.ticket.lock().take();
        drop(ticket);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn get_ref(&self) -> Option<&C> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut C> {
        self.inner.as_mut()
    }
}

impl<C> Drop for GracefulConn<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn closed_conn() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

impl<C: AsyncRead + Unpin> AsyncRead for GracefulConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(conn) => Pin::new(conn).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_conn())),
        }
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for GracefulConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().inner.as_mut() {
            Some(conn) => Pin::new(conn).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_conn())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(conn) => Pin::new(conn).poll_flush(cx),
            None => Poll::Ready(Err(closed_conn())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().inner.as_mut() {
            Some(conn) => Pin::new(conn).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::{mpsc, Mutex as AsyncMutex},
        time::{sleep, timeout, Instant},
    };

    use super::*;
    use crate::listener::Severer;

    /// In-memory transport: the test pushes connections into a channel.
    struct FakeListener {
        incoming: AsyncMutex<mpsc::UnboundedReceiver<FakeConn>>,
        stop_fails: bool,
    }

    struct FakeConn {
        severed: Arc<AtomicBool>,
    }

    impl FakeListener {
        fn new() -> (Self, mpsc::UnboundedSender<FakeConn>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let listener = Self {
                incoming: AsyncMutex::new(rx),
                stop_fails: false,
            };
            (listener, tx)
        }
    }

    impl Listener for FakeListener {
        type Conn = FakeConn;

        async fn accept(&self) -> io::Result<FakeConn> {
            self.incoming
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "fake closed"))
        }

        fn severer(conn: &FakeConn) -> io::Result<Severer> {
            let severed = conn.severed.clone();
            Ok(Severer::new(move || severed.store(true, Ordering::SeqCst)))
        }

        fn stop(&self) -> io::Result<()> {
            if self.stop_fails {
                Err(io::Error::new(io::ErrorKind::Other, "stop failed"))
            } else {
                Ok(())
            }
        }
    }

    fn fake_conn() -> (FakeConn, Arc<AtomicBool>) {
        let severed = Arc::new(AtomicBool::new(false));
        (
            FakeConn {
                severed: severed.clone(),
            },
            severed,
        )
    }

    async fn accept_n(
        listener: &GracefulListener<FakeListener>,
        tx: &mpsc::UnboundedSender<FakeConn>,
        n: usize,
    ) -> (Vec<GracefulConn<FakeConn>>, Vec<Arc<AtomicBool>>) {
        let mut conns = Vec::new();
        let mut flags = Vec::new();
        for _ in 0..n {
            let (conn, severed) = fake_conn();
            tx.send(conn).unwrap();
            conns.push(listener.accept().await.unwrap());
            flags.push(severed);
        }
        (conns, flags)
    }

    #[tokio::test]
    async fn wait_group_wakes_on_last_ticket() {
        let wg = WaitGroup::new();
        let tickets: Vec<_> = (0..10).map(|_| wg.add()).collect();
        assert_eq!(wg.count(), 10);

        let waiter = tokio::spawn({
            let wg = wg.clone();
            async move { wg.wait().await }
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(tickets);
        timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wg.count(), 0);
    }

    #[tokio::test]
    async fn release_with_no_connections_resolves_immediately() {
        let (fake, _tx) = FakeListener::new();
        let listener = GracefulListener::new(fake);
        listener.release(Duration::from_secs(60));
        timeout(Duration::from_millis(100), listener.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.forced_closures(), 0);
    }

    #[tokio::test]
    async fn connections_closed_in_time_are_not_forced() {
        let (fake, tx) = FakeListener::new();
        let listener = GracefulListener::new(fake);
        let (conns, flags) = accept_n(&listener, &tx, 5).await;
        assert_eq!(listener.open_connections(), 5);

        listener.release(Duration::from_millis(500));
        for mut conn in conns {
            sleep(Duration::from_millis(10)).await;
            conn.close();
        }
        timeout(Duration::from_secs(1), listener.close())
            .await
            .unwrap()
            .unwrap();

        // give the deadline a chance to misfire
        sleep(Duration::from_millis(600)).await;
        assert_eq!(listener.forced_closures(), 0);
        assert!(flags.iter().all(|f| !f.load(Ordering::SeqCst)));
    }

    #[tokio::test]
    async fn only_stragglers_are_forced_at_the_deadline() {
        let (fake, tx) = FakeListener::new();
        let listener = GracefulListener::new(fake);
        let (mut conns, flags) = accept_n(&listener, &tx, 4).await;

        let started = Instant::now();
        listener.release(Duration::from_millis(200));
        // close the first two, keep two open past the deadline
        conns.remove(0).close();
        conns.remove(0).close();

        sleep(Duration::from_millis(400)).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(listener.forced_closures(), 2);
        assert!(!flags[0].load(Ordering::SeqCst));
        assert!(!flags[1].load(Ordering::SeqCst));
        assert!(flags[2].load(Ordering::SeqCst));
        assert!(flags[3].load(Ordering::SeqCst));

        // the owners finish closing what was severed
        drop(conns);
        timeout(Duration::from_secs(1), listener.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn deadline_releases_connections_their_owners_still_hold() {
        let (fake, tx) = FakeListener::new();
        let listener = GracefulListener::new(fake);
        let (mut conns, flags) = accept_n(&listener, &tx, 1).await;

        listener.release(Duration::from_millis(100));
        timeout(Duration::from_secs(2), listener.close())
            .await
            .expect("close blocked on a severed connection")
            .unwrap();
        assert_eq!(listener.forced_closures(), 1);
        assert_eq!(listener.open_connections(), 0);
        assert!(flags[0].load(Ordering::SeqCst));

        // the owner closing late does not count the connection out a second time
        assert!(!conns[0].is_closed());
        conns[0].close();
        drop(conns);
        assert_eq!(listener.open_connections(), 0);
    }

    #[tokio::test]
    async fn close_twice_counts_once() {
        let (fake, tx) = FakeListener::new();
        let listener = GracefulListener::new(fake);
        let (mut conns, _flags) = accept_n(&listener, &tx, 2).await;

        conns[0].close();
        conns[0].close();
        assert!(conns[0].is_closed());
        assert_eq!(listener.open_connections(), 1);

        drop(conns);
        assert_eq!(listener.open_connections(), 0);
    }

    #[tokio::test]
    async fn released_listener_refuses_accept() {
        let (fake, tx) = FakeListener::new();
        let listener = Arc::new(GracefulListener::new(fake));

        let parked = tokio::spawn({
            let listener = listener.clone();
            async move { listener.accept().await.map(|_| ()) }
        });
        sleep(Duration::from_millis(20)).await;

        listener.release(Duration::from_secs(1));
        listener.release(Duration::from_secs(1));
        assert!(listener.is_released());

        let err = parked.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        let (conn, _) = fake_conn();
        let _ = tx.send(conn);
        let err = listener.accept().await.map(|_| ()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn close_reports_stop_error() {
        let (mut fake, _tx) = FakeListener::new();
        fake.stop_fails = true;
        let listener = GracefulListener::new(fake);
        listener.release(Duration::from_secs(1));
        assert!(listener.close().await.is_err());
    }

    #[tokio::test]
    async fn tcp_connections_drain_and_stragglers_see_eof() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = GracefulListener::new(tcp);
        let addr = listener.local_addr().unwrap();

        let mut polite = TcpStream::connect(addr).await.unwrap();
        let mut stubborn = TcpStream::connect(addr).await.unwrap();
        let mut served = Vec::new();
        for _ in 0..2 {
            served.push(listener.accept().await.unwrap());
        }

        // echo server for both connections
        let handles: Vec<_> = served
            .into_iter()
            .map(|mut conn| {
                tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    loop {
                        match conn.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if conn.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect();

        listener.release(Duration::from_millis(300));

        polite.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        polite.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");
        drop(polite);

        // the stubborn client never hangs up; the deadline does it for them
        let mut rest = Vec::new();
        timeout(Duration::from_secs(2), stubborn.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap_or(0);

        timeout(Duration::from_secs(2), listener.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listener.forced_closures(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
