//! Transport abstraction for peer connections.
//!
//! Connections run over any bidirectional byte stream. TCP is the
//! production transport; an in-memory transport backs the tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use crate::error::{NetError, Result};

/// A bidirectional byte stream to one peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Peer address as (ip, port). Transports without addressing report
    /// a placeholder.
    fn peer_addr(&self) -> (String, u16);
}

/// Server-side transport: yields one stream per inbound peer.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// Wait for the next inbound connection. Fails with
    /// [`NetError::Shutdown`] once [`Acceptor::shutdown`] has been
    /// called.
    async fn accept(&self) -> Result<Box<dyn PeerStream>>;

    /// Wake any pending and future `accept` calls with
    /// [`NetError::Shutdown`].
    fn shutdown(&self);
}

/// Client-side transport: dials one server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PeerStream>>;

    /// Human-readable target, for logs and errors.
    fn target(&self) -> String;
}

impl PeerStream for TcpStream {
    fn peer_addr(&self) -> (String, u16) {
        match TcpStream::peer_addr(self) {
            Ok(addr) => (addr.ip().to_string(), addr.port()),
            Err(_) => ("unknown".to_owned(), 0),
        }
    }
}

/// TCP listener with shutdown-wakeable accept.
pub struct TcpAcceptor {
    listener: TcpListener,
    stopped: AtomicBool,
    stop: Notify,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            stopped: AtomicBool::new(false),
            stop: Notify::new(),
        })
    }

    /// The locally bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Box<dyn PeerStream>> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(NetError::Shutdown);
            }
            tokio::select! {
                res = self.listener.accept() => {
                    let (stream, _) = res?;
                    // latency matters more than throughput here
                    let _ = stream.set_nodelay(true);
                    return Ok(Box::new(stream));
                }
                _ = self.stop.notified() => {}
            }
        }
    }

    fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stop.notify_waiters();
    }
}

/// TCP dialer with a connect timeout.
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn PeerStream>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetError::ConnectTimeout)??;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}

/// In-memory transport pairing one acceptor with any number of
/// connectors, for tests that need a full client/server loop without
/// sockets.
pub mod memory {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio::sync::{mpsc, Mutex};

    const PIPE_CAPACITY: usize = 64 * 1024;

    /// One half of an in-memory duplex pipe.
    pub struct MemoryStream {
        inner: DuplexStream,
    }

    impl AsyncRead for MemoryStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncWrite for MemoryStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Pin::new(&mut self.inner).poll_write(cx, buf)
        }

        fn poll_flush(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
        ) -> Poll<std::io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    impl PeerStream for MemoryStream {
        fn peer_addr(&self) -> (String, u16) {
            ("memory".to_owned(), 0)
        }
    }

    /// Build a linked connector/acceptor pair.
    pub fn link() -> (MemoryConnector, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            MemoryConnector { tx },
            MemoryAcceptor {
                rx: Mutex::new(rx),
                stopped: AtomicBool::new(false),
                stop: Notify::new(),
            },
        )
    }

    #[derive(Clone)]
    pub struct MemoryConnector {
        tx: mpsc::UnboundedSender<MemoryStream>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<Box<dyn PeerStream>> {
            let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
            self.tx
                .send(MemoryStream { inner: far })
                .map_err(|_| NetError::Closed)?;
            Ok(Box::new(MemoryStream { inner: near }))
        }

        fn target(&self) -> String {
            "memory".to_owned()
        }
    }

    pub struct MemoryAcceptor {
        rx: Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
        stopped: AtomicBool,
        stop: Notify,
    }

    #[async_trait]
    impl Acceptor for MemoryAcceptor {
        async fn accept(&self) -> Result<Box<dyn PeerStream>> {
            loop {
                if self.stopped.load(Ordering::Acquire) {
                    return Err(NetError::Shutdown);
                }
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    stream = rx.recv() => {
                        return stream.map(|s| Box::new(s) as Box<dyn PeerStream>).ok_or(NetError::Closed);
                    }
                    _ = self.stop.notified() => {}
                }
            }
        }

        fn shutdown(&self) {
            self.stopped.store(true, Ordering::Release);
            self.stop.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_link_roundtrip() {
        let (connector, acceptor) = memory::link();
        let mut client = connector.connect().await.unwrap();
        let mut server = acceptor.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_acceptor_shutdown_wakes_accept() {
        let (_connector, acceptor) = memory::link();
        let acceptor = std::sync::Arc::new(acceptor);
        let waiter = {
            let acceptor = acceptor.clone();
            tokio::spawn(async move { acceptor.accept().await })
        };
        tokio::task::yield_now().await;
        acceptor.shutdown();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(NetError::Shutdown)));
    }

    #[tokio::test]
    async fn test_tcp_acceptor_accepts_connection() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        let connector = TcpConnector::new(addr.to_string(), Duration::from_secs(1));

        let (client, server) =
            tokio::join!(connector.connect(), acceptor.accept());
        let client = client.unwrap();
        let server = server.unwrap();
        assert_eq!(server.peer_addr().0, "127.0.0.1");
        assert_ne!(client.peer_addr().1, 0);
    }
}
