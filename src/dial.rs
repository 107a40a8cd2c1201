use std::{future::Future, io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::future::FutureExt;
use tracing::debug;

use crate::parse::Authority;

/// Default bound on an outbound TCP connect, including name resolution.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens outbound byte streams to origins and tunnel targets.
///
/// Failures are reported as plain [`io::Error`]s and surface to the client as
/// `502 Bad Gateway`. Dials are never retried.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn dial(&self, authority: &Authority) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Dials plain TCP through the system resolver.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(&self, authority: &Authority) -> io::Result<TcpStream> {
        // IPv6 literals keep their brackets, which the resolver does not accept.
        let host = authority.host.trim_start_matches('[').trim_end_matches(']');
        let stream = TcpStream::connect((host, authority.port))
            .timeout(self.connect_timeout)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true).ok();
        debug!(%authority, peer = ?stream.peer_addr().ok(), "dialed");
        Ok(stream)
    }
}
