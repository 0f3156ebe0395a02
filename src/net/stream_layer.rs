//! One shared listener for consensus RPCs and replication streams.
//!
//! Every inbound connection starts with a single tag byte: [`STREAM_TAG`]
//! selects the replication stream path, anything else is consensus RPC
//! framing. Dialers write their tag before the first frame. TLS can wrap
//! either side with separate server and peer materials.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Tag written by consensus dialers.
pub const CONSENSUS_TAG: u8 = 0;
/// Tag selecting the replication-log stream path.
pub const STREAM_TAG: u8 = 1;

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// A demultiplexed transport connection, possibly TLS-wrapped.
pub type Connection = Box<dyn AsyncStream>;

/// Shared listener handle installed into the replication config.
#[derive(Clone)]
pub struct StreamLayer {
    listener: Arc<TcpListener>,
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
}

impl StreamLayer {
    /// Wraps a bound listener. `server_tls` guards inbound connections,
    /// `peer_tls` outbound dials; either may be absent for plaintext.
    pub fn new(
        listener: TcpListener,
        server_tls: Option<Arc<ServerConfig>>,
        peer_tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        StreamLayer {
            listener: Arc::new(listener),
            server_tls: server_tls.map(TlsAcceptor::from),
            peer_tls: peer_tls.map(TlsConnector::from),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts one connection and reads its tag byte.
    pub async fn accept(&self) -> Result<(Connection, u8)> {
        let (stream, _) = self.listener.accept().await?;
        stream.set_nodelay(true).ok();
        let mut conn: Connection = match &self.server_tls {
            Some(acceptor) => Box::new(acceptor.accept(stream).await?),
            None => Box::new(stream),
        };
        let tag = conn.read_u8().await?;
        Ok((conn, tag))
    }

    /// Dials a peer, writing `tag` as the first byte of the connection.
    pub async fn dial(&self, addr: &str, tag: u8) -> Result<Connection> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        let mut conn: Connection = match &self.peer_tls {
            Some(connector) => {
                let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|_| Error::Protocol(format!("invalid peer name {host:?}")))?;
                Box::new(connector.connect(server_name, stream).await?)
            }
            None => Box::new(stream),
        };
        conn.write_u8(tag).await?;
        conn.flush().await?;
        Ok(conn)
    }
}

impl fmt::Debug for StreamLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLayer")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("server_tls", &self.server_tls.is_some())
            .field("peer_tls", &self.peer_tls.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bound_layer() -> StreamLayer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        StreamLayer::new(listener, None, None)
    }

    #[tokio::test]
    async fn test_dial_tag_reaches_accept() {
        let layer = bound_layer().await;
        let addr = layer.local_addr().unwrap().to_string();

        let dialer = layer.clone();
        let dial = tokio::spawn(async move {
            let mut conn = dialer.dial(&addr, STREAM_TAG).await.unwrap();
            conn.write_all(b"after-tag").await.unwrap();
            conn.flush().await.unwrap();
        });

        let (mut conn, tag) = layer.accept().await.unwrap();
        assert_eq!(tag, STREAM_TAG);

        let mut buf = [0u8; 9];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"after-tag");
        dial.await.unwrap();
    }

    #[tokio::test]
    async fn test_consensus_tag() {
        let layer = bound_layer().await;
        let addr = layer.local_addr().unwrap().to_string();

        let dialer = layer.clone();
        tokio::spawn(async move {
            let _conn = dialer.dial(&addr, CONSENSUS_TAG).await.unwrap();
            // Keep the connection open until the accept side has read the tag.
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let (_, tag) = layer.accept().await.unwrap();
        assert_eq!(tag, CONSENSUS_TAG);
    }
}
