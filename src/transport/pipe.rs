//! Local transport for nodes on the same machine.
//!
//! - Unix: Unix Domain Socket
//! - Windows: Named Pipe
//!
//! # Example
//!
//! ```ignore
//! use raconteur_transport::transport::{generate_local_path, LocalListener, LocalStream};
//!
//! let path = generate_local_path();
//! let listener = LocalListener::bind(&path).await?;
//! let server = listener.accept(&builder).await?;
//! let client = builder.connect(LocalStream::connect(&path).await?).await?;
//! ```

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::error::Result;

use super::builder::ConnectionBuilder;
use super::connection::StreamTransport;

/// Generate a unique local socket path for this process.
///
/// Format:
/// - Unix: `{tmp}/raconteur-{pid}-{uuid}.sock`
/// - Windows: `\\.\pipe\raconteur-{pid}-{uuid}`
pub fn generate_local_path() -> String {
    let pid = std::process::id();
    let id = uuid::Uuid::new_v4().simple();

    #[cfg(unix)]
    {
        std::env::temp_dir()
            .join(format!("raconteur-{}-{}.sock", pid, id))
            .to_string_lossy()
            .into_owned()
    }

    #[cfg(windows)]
    {
        format!(r"\\.\pipe\raconteur-{}-{}", pid, id)
    }
}

// ============================================================================
// Unix Implementation
// ============================================================================

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use std::path::Path;
    use tokio::net::{UnixListener, UnixStream};

    /// Unix Domain Socket listener. Removes its socket file on drop.
    pub struct LocalListener {
        listener: UnixListener,
        path: String,
    }

    /// Connected Unix Domain Socket.
    pub struct LocalStream {
        pub(super) stream: UnixStream,
    }

    impl LocalListener {
        /// Bind to a Unix socket path, replacing a stale socket file.
        pub async fn bind(path: &str) -> Result<Self> {
            if Path::new(path).exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            Ok(Self {
                listener,
                path: path.to_string(),
            })
        }

        /// Accept a single raw stream.
        pub async fn accept_stream(&self) -> Result<LocalStream> {
            let (stream, _addr) = self.listener.accept().await?;
            Ok(LocalStream { stream })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for LocalListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    impl LocalStream {
        pub async fn connect(path: &str) -> Result<Self> {
            Ok(Self {
                stream: UnixStream::connect(path).await?,
            })
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    /// Named Pipe listener. A fresh pipe instance is created per accept.
    pub struct LocalListener {
        path: String,
        next: tokio::sync::Mutex<NamedPipeServer>,
    }

    /// Connected Named Pipe, either end.
    pub struct LocalStream {
        pub(super) stream: PipeEnd,
    }

    pub(super) enum PipeEnd {
        Server(NamedPipeServer),
        Client(NamedPipeClient),
    }

    impl LocalListener {
        pub async fn bind(path: &str) -> Result<Self> {
            let first = ServerOptions::new().first_pipe_instance(true).create(path)?;
            Ok(Self {
                path: path.to_string(),
                next: tokio::sync::Mutex::new(first),
            })
        }

        pub async fn accept_stream(&self) -> Result<LocalStream> {
            let mut next = self.next.lock().await;
            next.connect().await?;
            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut *next, fresh);
            Ok(LocalStream {
                stream: PipeEnd::Server(connected),
            })
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl LocalStream {
        pub async fn connect(path: &str) -> Result<Self> {
            let client = ClientOptions::new().open(path)?;
            Ok(Self {
                stream: PipeEnd::Client(client),
            })
        }
    }

    impl AsyncRead for PipeEnd {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeEnd::Server(p) => Pin::new(p).poll_read(cx, buf),
                PipeEnd::Client(p) => Pin::new(p).poll_read(cx, buf),
            }
        }
    }

    impl AsyncWrite for PipeEnd {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            match self.get_mut() {
                PipeEnd::Server(p) => Pin::new(p).poll_write(cx, buf),
                PipeEnd::Client(p) => Pin::new(p).poll_write(cx, buf),
            }
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeEnd::Server(p) => Pin::new(p).poll_flush(cx),
                PipeEnd::Client(p) => Pin::new(p).poll_flush(cx),
            }
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            match self.get_mut() {
                PipeEnd::Server(p) => Pin::new(p).poll_shutdown(cx),
                PipeEnd::Client(p) => Pin::new(p).poll_shutdown(cx),
            }
        }
    }
}

// ============================================================================
// Platform-independent surface
// ============================================================================

#[cfg(unix)]
pub use unix_impl::{LocalListener, LocalStream};

#[cfg(windows)]
pub use windows_impl::{LocalListener, LocalStream};

impl LocalListener {
    /// Accept one connection and start the server side on it.
    pub async fn accept(&self, builder: &ConnectionBuilder) -> Result<StreamTransport> {
        let stream = self.accept_stream().await?;
        let connection = builder.accept(stream)?;
        debug!(
            connection_id = connection.connection_id(),
            path = self.path(),
            "Local connection accepted"
        );
        Ok(connection)
    }
}

/// Dial a local listener and run the client handshake.
pub async fn connect_local(path: &str, builder: &ConnectionBuilder) -> Result<StreamTransport> {
    let stream = LocalStream::connect(path).await?;
    builder.connect(stream).await
}

impl AsyncRead for LocalStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
