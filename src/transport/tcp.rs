//! TCP front end for the stream engine.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

use super::builder::ConnectionBuilder;
use super::connection::StreamTransport;

/// Dial `addr` and run the client handshake.
pub async fn connect<A: ToSocketAddrs>(addr: A, builder: &ConnectionBuilder) -> Result<StreamTransport> {
    let timeout = builder.transport_config().connect_timeout();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout("TCP connect timed out".into()))??;
    stream.set_nodelay(true)?;
    debug!(peer = ?stream.peer_addr().ok(), "TCP connected");
    builder.connect(stream).await
}

/// Listening socket producing server-side connections.
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    /// Bind to `addr` (e.g. "127.0.0.1:0").
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = ?listener.local_addr().ok(), "TCP listener bound");
        Ok(Self { listener })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one connection and start the server side on it.
    pub async fn accept(&self, builder: &ConnectionBuilder) -> Result<StreamTransport> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let connection = builder.accept(stream)?;
        debug!(
            connection_id = connection.connection_id(),
            %peer,
            "TCP connection accepted"
        );
        Ok(connection)
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Accept errors are logged and do not stop the loop.
    pub async fn serve(&self, builder: ConnectionBuilder, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("TCP listener shutting down");
                    return Ok(());
                }
                accepted = self.accept(&builder) => {
                    if let Err(e) = accepted {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }
}
