//! Stream transport engine and its front ends.
//!
//! - [`StreamTransport`]: one running connection over any byte stream
//! - [`ConnectionBuilder`]: configuration and client/server start-up
//! - TCP and local (Unix socket / Named Pipe) listeners and dialers

mod builder;
mod connection;
mod pipe;
mod send_queue;
mod stream;
mod tcp;

pub use builder::ConnectionBuilder;
pub use connection::{
    StreamTransport, STREAM_OP_CREATE_CONNECTION, STREAM_OP_GET_REMOTE_NODE_ID, STREAM_OP_STARTTLS,
};
pub use pipe::{connect_local, generate_local_path, LocalListener, LocalStream};
pub use stream::{boxed, BoxedStream, StreamReader, TransportStream};
pub use tcp::{connect as connect_tcp, TcpTransportListener};
