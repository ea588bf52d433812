//! Transport abstraction for the exchange.
//!
//! A connector carries one encoded request envelope to a host and returns
//! the host's encoded response. Envelopes are self-delimiting, so stream
//! transports need no extra framing.

use async_trait::async_trait;
use bytes::Bytes;
use rolesync_core::HostIdentifier;

use crate::error::Result;

/// Delivers request envelopes to hosts.
///
/// Implementations must be thread-safe (Send + Sync). Timeouts surface as
/// ordinary transport errors.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn exchange(&self, host: &HostIdentifier, request: Bytes) -> Result<Bytes>;
}

/// Host side of a connector: turns one request envelope into one response.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Bytes) -> Result<Bytes>;
}

/// An in-process network for tests.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    use crate::error::SyncError;

    /// Routes requests to registered handlers by host identifier.
    #[derive(Default)]
    pub struct MemoryNetwork {
        hosts: RwLock<HashMap<HostIdentifier, Arc<dyn RequestHandler>>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub async fn register(&self, host: HostIdentifier, handler: Arc<dyn RequestHandler>) {
            self.hosts.write().await.insert(host, handler);
        }

        /// Requests to an unregistered host fail like a refused connection.
        pub async fn unregister(&self, host: &HostIdentifier) {
            self.hosts.write().await.remove(host);
        }
    }

    #[async_trait]
    impl Connector for MemoryNetwork {
        async fn exchange(&self, host: &HostIdentifier, request: Bytes) -> Result<Bytes> {
            let handler = self
                .hosts
                .read()
                .await
                .get(host)
                .cloned()
                .ok_or_else(|| SyncError::Transport(format!("host {host} unreachable")))?;
            handler.handle(request).await
        }
    }
}

/// TCP transport: one connection per exchange.
pub mod tcp {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use rolesync_core::MAX_IDENTIFIER_LEN;
    use rolesync_envelope::MAX_FRAME_LEN;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tracing::{debug, warn};

    use crate::error::SyncError;

    fn io_error(e: std::io::Error) -> SyncError {
        SyncError::Transport(e.to_string())
    }

    /// Read one outer envelope frame: `[u8 len][type][u32 len][body]`.
    ///
    /// Returns `None` on a clean end of stream before the first byte.
    pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Bytes>> {
        let type_len = match reader.read_u8().await {
            Ok(n) => n as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        if type_len == 0 || type_len > MAX_IDENTIFIER_LEN {
            return Err(SyncError::Transport(format!("bad packet type length {type_len}")));
        }
        let mut frame = Vec::with_capacity(1 + type_len + 4);
        frame.push(type_len as u8);
        frame.resize(1 + type_len, 0);
        reader.read_exact(&mut frame[1..]).await.map_err(io_error)?;

        let body_len = reader.read_u32().await.map_err(io_error)? as usize;
        if body_len > MAX_FRAME_LEN {
            return Err(SyncError::Transport(format!(
                "frame of {body_len} bytes exceeds {MAX_FRAME_LEN}"
            )));
        }
        frame.extend_from_slice(&(body_len as u32).to_be_bytes());
        let start = frame.len();
        frame.resize(start + body_len, 0);
        reader.read_exact(&mut frame[start..]).await.map_err(io_error)?;
        Ok(Some(Bytes::from(frame)))
    }

    /// Connects to hosts listed in a directory.
    pub struct TcpConnector {
        directory: HashMap<HostIdentifier, SocketAddr>,
        timeout: Duration,
    }

    impl TcpConnector {
        pub fn new(directory: HashMap<HostIdentifier, SocketAddr>, timeout: Duration) -> Self {
            Self { directory, timeout }
        }

        async fn round_trip(&self, addr: SocketAddr, request: &[u8]) -> Result<Bytes> {
            let mut stream = TcpStream::connect(addr).await.map_err(io_error)?;
            stream.write_all(request).await.map_err(io_error)?;
            stream.flush().await.map_err(io_error)?;
            read_frame(&mut stream)
                .await?
                .ok_or_else(|| SyncError::Transport(format!("{addr} closed without a response")))
        }
    }

    #[async_trait]
    impl Connector for TcpConnector {
        async fn exchange(&self, host: &HostIdentifier, request: Bytes) -> Result<Bytes> {
            let addr = *self
                .directory
                .get(host)
                .ok_or_else(|| SyncError::Transport(format!("no address for {host}")))?;
            debug!(%host, %addr, bytes = request.len(), "exchanging");
            tokio::time::timeout(self.timeout, self.round_trip(addr, &request))
                .await
                .map_err(|_| SyncError::Timeout(format!("{host} after {:?}", self.timeout)))?
        }
    }

    /// Serve requests on `listener` until accepting fails.
    ///
    /// Each connection may carry several requests, answered in order.
    pub async fn serve(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> Result<()> {
        loop {
            let (mut stream, peer) = listener.accept().await.map_err(io_error)?;
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let request = match read_frame(&mut stream).await {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(%peer, error = %e, "dropping connection");
                            break;
                        }
                    };
                    let response = match handler.handle(request).await {
                        Ok(response) => response,
                        Err(e) => {
                            warn!(%peer, error = %e, "handler failed");
                            break;
                        }
                    };
                    if let Err(e) = stream.write_all(&response).await {
                        warn!(%peer, error = %e, "write failed");
                        break;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::tcp::{read_frame, serve, TcpConnector};
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::error::SyncError;

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, request: Bytes) -> Result<Bytes> {
            Ok(request)
        }
    }

    fn frame(body: &[u8]) -> Bytes {
        let mut out = vec![4];
        out.extend_from_slice(b"test");
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(body);
        Bytes::from(out)
    }

    #[tokio::test]
    async fn test_memory_network_routes() {
        let network = MemoryNetwork::new();
        let host = HostIdentifier::new("host.test").unwrap();
        network.register(host.clone(), Arc::new(Echo)).await;

        let out = network.exchange(&host, Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(out.as_ref(), b"ping");

        network.unregister(&host).await;
        let err = network.exchange(&host, Bytes::from_static(b"ping")).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn test_read_frame() {
        let bytes = frame(b"hello");
        let mut reader = &bytes[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), Some(bytes.clone()));
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_frame_truncated() {
        let bytes = frame(b"hello");
        let mut reader = &bytes[..bytes.len() - 1];
        assert!(read_frame(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::new(Echo)));

        let host = HostIdentifier::new("host.test").unwrap();
        let connector = TcpConnector::new(
            HashMap::from([(host.clone(), addr)]),
            Duration::from_secs(5),
        );
        let request = frame(b"payload");
        assert_eq!(connector.exchange(&host, request.clone()).await.unwrap(), request);

        let unknown = HostIdentifier::new("nowhere.test").unwrap();
        assert!(matches!(
            connector.exchange(&unknown, request).await,
            Err(SyncError::Transport(_))
        ));
    }
}
