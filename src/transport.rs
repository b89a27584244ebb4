//! # Transport boundary
//!
//! Raw byte-stream establishment keyed by [`Multiaddr`]. Nothing here is
//! authenticated or encrypted; the [`crate::upgrader`] turns a
//! [`RawConnection`] into a secure multiplexed connection.
//!
//! Two implementations ship with the crate:
//!
//! - [`TcpTransport`]: `/ip4|ip6/<host>/tcp/<port>`
//! - [`MemoryTransport`]: `/memory/<port>` over in-process duplex pipes,
//!   sharing a [`MemoryNetwork`] registry. Used by tests and by embedders that
//!   run several hosts in one process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::multiaddr::Multiaddr;

/// Time allowed for a TCP connect before the dial attempt is abandoned.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer size of each direction of an in-memory pipe.
pub const MEMORY_PIPE_CAPACITY: usize = 256 * 1024;

/// Pending connections queued on an in-memory listener.
const MEMORY_ACCEPT_BACKLOG: usize = 64;

/// Which side initiated a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Any bidirectional byte stream.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawStream for T {}

pub type RawConnection = Box<dyn RawStream>;

#[async_trait]
pub trait Listener: Send + 'static {
    fn local_addr(&self) -> Multiaddr;

    /// Next inbound link and the remote address it came from.
    async fn accept(&mut self) -> Result<(RawConnection, Multiaddr)>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn can_dial(&self, addr: &Multiaddr) -> bool;

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection>;

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>>;
}

// ============================================================================
// TCP
// ============================================================================

#[derive(Clone, Debug)]
pub struct TcpTransport {
    dial_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

impl TcpTransport {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

struct TcpListenerAdapter {
    inner: TcpListener,
    local: Multiaddr,
}

#[async_trait]
impl Listener for TcpListenerAdapter {
    fn local_addr(&self) -> Multiaddr {
        self.local.clone()
    }

    async fn accept(&mut self) -> Result<(RawConnection, Multiaddr)> {
        let (stream, remote) = self.inner.accept().await.context("tcp accept failed")?;
        let _ = stream.set_nodelay(true);
        Ok((Box::new(stream), Multiaddr::from_socket_addr(remote)))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        !addr.is_circuit() && addr.to_socket_addr().is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection> {
        let socket = addr
            .to_socket_addr()
            .ok_or_else(|| anyhow!("not a tcp address: {addr}"))?;
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(socket))
            .await
            .map_err(|_| anyhow!("tcp dial to {addr} timed out"))?
            .with_context(|| format!("tcp dial to {addr} failed"))?;
        let _ = stream.set_nodelay(true);
        trace!(addr = %addr, "tcp dial established");
        Ok(Box::new(stream))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>> {
        let socket = addr
            .to_socket_addr()
            .ok_or_else(|| anyhow!("not a tcp address: {addr}"))?;
        let inner = TcpListener::bind(socket)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local = Multiaddr::from_socket_addr(inner.local_addr()?);
        debug!(addr = %local, "tcp listener bound");
        Ok(Box::new(TcpListenerAdapter { inner, local }))
    }
}

// ============================================================================
// In-memory
// ============================================================================

type MemoryBacklog = mpsc::Sender<(DuplexStream, Multiaddr)>;

/// Registry shared by every [`MemoryTransport`] that should see each other.
pub struct MemoryNetwork {
    listeners: DashMap<u64, MemoryBacklog>,
    next_port: AtomicU64,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            listeners: DashMap::new(),
            next_port: AtomicU64::new(1),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn allocate_port(&self) -> u64 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if !self.listeners.contains_key(&port) {
                return port;
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

struct MemoryListener {
    port: u64,
    backlog: mpsc::Receiver<(DuplexStream, Multiaddr)>,
    network: Arc<MemoryNetwork>,
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.port);
    }
}

#[async_trait]
impl Listener for MemoryListener {
    fn local_addr(&self) -> Multiaddr {
        Multiaddr::memory(self.port)
    }

    async fn accept(&mut self) -> Result<(RawConnection, Multiaddr)> {
        let (stream, remote) = self
            .backlog
            .recv()
            .await
            .ok_or_else(|| anyhow!("memory listener closed"))?;
        Ok((Box::new(stream), remote))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        !addr.is_circuit() && addr.memory_port().is_some()
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection> {
        let port = addr
            .memory_port()
            .ok_or_else(|| anyhow!("not a memory address: {addr}"))?;
        let backlog = self
            .network
            .listeners
            .get(&port)
            .map(|l| l.clone())
            .ok_or_else(|| anyhow!("connection refused: nothing listening on {addr}"))?;

        let (local, remote) = tokio::io::duplex(MEMORY_PIPE_CAPACITY);
        // Ephemeral "source port" so the listener can tell dialers apart.
        let source = Multiaddr::memory(self.network.allocate_port());
        if backlog.send((remote, source)).await.is_err() {
            bail!("connection refused: listener on {addr} closed");
        }
        Ok(Box::new(local))
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>> {
        let requested = addr
            .memory_port()
            .ok_or_else(|| anyhow!("not a memory address: {addr}"))?;
        let port = if requested == 0 {
            self.network.allocate_port()
        } else {
            requested
        };

        let (tx, rx) = mpsc::channel(MEMORY_ACCEPT_BACKLOG);
        match self.network.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                bail!("memory port {port} already in use");
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        Ok(Box::new(MemoryListener {
            port,
            backlog: rx,
            network: self.network.clone(),
        }))
    }
}

/// Dispatches to the first inner transport that can dial an address.
pub struct MultiTransport {
    transports: Vec<Arc<dyn Transport>>,
}

impl MultiTransport {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    fn pick(&self, addr: &Multiaddr) -> Result<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.can_dial(addr))
            .ok_or_else(|| anyhow!("no transport for {addr}"))
    }
}

#[async_trait]
impl Transport for MultiTransport {
    fn can_dial(&self, addr: &Multiaddr) -> bool {
        self.transports.iter().any(|t| t.can_dial(addr))
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection> {
        self.pick(addr)?.dial(addr).await
    }

    async fn listen(&self, addr: &Multiaddr) -> Result<Box<dyn Listener>> {
        self.pick(addr)?.listen(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_dial_and_accept() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::new(network.clone());

        let mut listener = transport.listen(&Multiaddr::memory(0)).await.unwrap();
        let addr = listener.local_addr();

        let mut client = transport.dial(&addr).await.unwrap();
        let (mut server, remote) = listener.accept().await.unwrap();
        assert!(remote.memory_port().is_some());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn memory_refuses_unknown_port_and_dropped_listener() {
        let network = MemoryNetwork::new();
        let transport = MemoryTransport::new(network);

        assert!(transport.dial(&Multiaddr::memory(4242)).await.is_err());

        let listener = transport.listen(&Multiaddr::memory(0)).await.unwrap();
        let addr = listener.local_addr();
        drop(listener);
        assert!(transport.dial(&addr).await.is_err());
    }

    #[tokio::test]
    async fn memory_port_conflict() {
        let transport = MemoryTransport::new(MemoryNetwork::new());
        let _a = transport.listen(&Multiaddr::memory(77)).await.unwrap();
        assert!(transport.listen(&Multiaddr::memory(77)).await.is_err());
    }

    #[tokio::test]
    async fn tcp_loopback() {
        let transport = TcpTransport::default();
        let mut listener = transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr();
        assert!(transport.can_dial(&addr));

        let mut client = transport.dial(&addr).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();
        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn multi_transport_dispatch() {
        let multi = MultiTransport::new(vec![
            Arc::new(TcpTransport::default()),
            Arc::new(MemoryTransport::new(MemoryNetwork::new())),
        ]);
        assert!(multi.can_dial(&Multiaddr::memory(1)));
        assert!(multi.can_dial(&"/ip4/1.2.3.4/tcp/1".parse().unwrap()));
        assert!(!multi.can_dial(&"/dns/example.com/tcp/1".parse().unwrap()));
    }
}
