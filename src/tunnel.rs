//! CONNECT tunnels.
//!
//! A tunnel moves through these states:
//!
//! ```text
//! Authenticating ──allowed──> Dialing ──ok──> Established ──> Piping ──> Closed
//!       │                        │
//!       └─denied/failed─> Rejected ──> Closed
//!                                └─error─> DialFailed ──> Closed
//! ```
//!
//! [`TunnelManager::open`] runs everything up to `Established` and writes the
//! `200 Connection established` line. The returned [`Tunnel`] is then piped
//! with [`Tunnel::pipe`], or taken apart by code that speaks its own protocol
//! over the client stream.

use std::{sync::Arc, time::Duration};

use http::StatusCode;
use n0_error::e;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    auth::{AuthDecision, AuthGate},
    config::DEFAULT_DRAIN_TIMEOUT,
    dial::Dialer,
    error::ProxyError,
    handoff::HandoffBuffer,
    parse::{Authority, CONNECT_ESTABLISHED, HttpRequest, HttpResponse},
    util::forward_bidi,
};

/// Lifecycle state of a CONNECT tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TunnelState {
    Authenticating,
    Dialing,
    Established,
    Piping,
    Rejected,
    DialFailed,
    Closed,
}

impl TunnelState {
    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_enter(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Authenticating, Dialing | Rejected)
                | (Dialing, Established | DialFailed)
                | (Established, Piping)
                | (Rejected | DialFailed | Piping, Closed)
                // The client went away while we were waiting on it.
                | (Authenticating | Dialing | Established, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == TunnelState::Closed
    }
}

/// Tracks the state of one tunnel and logs every transition.
#[derive(Debug)]
struct StateMachine {
    state: TunnelState,
}

impl StateMachine {
    fn new() -> Self {
        debug!(state = %TunnelState::Authenticating, "tunnel opened");
        Self {
            state: TunnelState::Authenticating,
        }
    }

    fn enter(&mut self, next: TunnelState) {
        debug_assert!(
            self.state.can_enter(next),
            "invalid tunnel transition {} -> {next}",
            self.state
        );
        debug!(from = %self.state, to = %next, "tunnel state");
        self.state = next;
    }
}

/// Opens CONNECT tunnels: authenticates, dials, and confirms to the client.
#[derive(derive_more::Debug)]
pub struct TunnelManager<D> {
    gate: AuthGate,
    #[debug(skip)]
    dialer: Arc<D>,
    drain_timeout: Duration,
}

impl<D> Clone for TunnelManager<D> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            dialer: self.dialer.clone(),
            drain_timeout: self.drain_timeout,
        }
    }
}

impl<D: Dialer> TunnelManager<D> {
    pub fn new(gate: AuthGate, dialer: Arc<D>) -> Self {
        Self {
            gate,
            dialer,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Sets how long a piped tunnel keeps relaying after one side closed.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Runs a CONNECT request up to the established state.
    ///
    /// `target` is the classified CONNECT authority; the hook runs before a
    /// malformed target is reported. `client` holds every client byte that
    /// followed the request head and keeps queueing while the hook and the
    /// dial are pending.
    ///
    /// On success the `200 Connection established` line has been written.
    /// On failure the proxy has written its status line, if any, and closed
    /// the client stream:
    ///
    /// - denied: the hook's denial (by default `407`)
    /// - malformed target: `400`
    /// - hook error or timeout: nothing
    /// - dial error: `502`
    pub async fn open<R, W>(
        &self,
        req: &HttpRequest,
        target: Result<Authority, ProxyError>,
        mut client: HandoffBuffer<R>,
        mut client_send: W,
    ) -> Result<Tunnel<R, W, D::Stream>, ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut sm = StateMachine::new();

        let decision = match client.buffer_while(self.gate.check(req)).await {
            Ok(decision) => decision,
            Err(err) => {
                sm.enter(TunnelState::Closed);
                return Err(err.into());
            }
        };
        let authority = match (decision, target) {
            (Ok(AuthDecision::Allowed), Ok(authority)) => authority,
            (Ok(AuthDecision::Denied(denial)), _) => {
                sm.enter(TunnelState::Rejected);
                reject(&mut client_send, Some(denial.to_response())).await;
                sm.enter(TunnelState::Closed);
                return Err(e!(ProxyError::Denied {
                    status: denial.status
                }));
            }
            (Ok(AuthDecision::Allowed), Err(err)) => {
                sm.enter(TunnelState::Rejected);
                let response = err.response_status().map(HttpResponse::closing);
                reject(&mut client_send, response).await;
                sm.enter(TunnelState::Closed);
                return Err(err);
            }
            (Err(err), _) => {
                sm.enter(TunnelState::Rejected);
                reject(&mut client_send, None).await;
                sm.enter(TunnelState::Closed);
                return Err(err);
            }
        };

        sm.enter(TunnelState::Dialing);
        let dialed = match client.buffer_while(self.dialer.dial(&authority)).await {
            Ok(dialed) => dialed,
            Err(err) => {
                sm.enter(TunnelState::Closed);
                return Err(err.into());
            }
        };
        let target = match dialed {
            Ok(target) => target,
            Err(source) => {
                sm.enter(TunnelState::DialFailed);
                warn!(%authority, "tunnel dial failed: {source:#}");
                reject(
                    &mut client_send,
                    Some(HttpResponse::closing(StatusCode::BAD_GATEWAY)),
                )
                .await;
                sm.enter(TunnelState::Closed);
                return Err(e!(ProxyError::Connect { authority, source }));
            }
        };

        sm.enter(TunnelState::Established);
        let confirmed = async {
            client_send.write_all(CONNECT_ESTABLISHED).await?;
            client_send.flush().await
        };
        if let Err(err) = confirmed.await {
            sm.enter(TunnelState::Closed);
            return Err(err.into());
        }
        debug!(%authority, pending = client.pending().len(), "tunnel established");
        Ok(Tunnel {
            sm,
            authority,
            client,
            client_send,
            target,
            drain_timeout: self.drain_timeout,
        })
    }
}

/// Writes `response`, if any, and closes the client's write side.
async fn reject(client_send: &mut (impl AsyncWrite + Unpin), response: Option<HttpResponse>) {
    if let Some(response) = response
        && let Err(err) = response.write(client_send).await
    {
        warn!("failed to write rejection to client: {err:#}");
    }
    client_send.shutdown().await.ok();
}

/// An established CONNECT tunnel.
///
/// The client side is a [`HandoffBuffer`] holding every byte the client sent
/// after the CONNECT head, so code that takes the tunnel over reads exactly
/// what a fresh socket would have delivered.
#[derive(derive_more::Debug)]
pub struct Tunnel<R, W, T> {
    sm: StateMachine,
    authority: Authority,
    #[debug(skip)]
    client: HandoffBuffer<R>,
    #[debug(skip)]
    client_send: W,
    #[debug(skip)]
    target: T,
    drain_timeout: Duration,
}

impl<R, W, T> Tunnel<R, W, T>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn state(&self) -> TunnelState {
        self.sm.state
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The client side, for code that reads from the tunnel before piping.
    ///
    /// Attach to read; whatever is left unread when the reader detaches is
    /// delivered to the pipe first.
    pub fn client_mut(&mut self) -> &mut HandoffBuffer<R> {
        &mut self.client
    }

    /// The client's write side.
    pub fn client_send_mut(&mut self) -> &mut W {
        &mut self.client_send
    }

    /// The stream to the tunnel target.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Relays bytes in both directions until both sides are done.
    ///
    /// EOF on one side is passed on as a write shutdown to the other, which
    /// then has the drain timeout to finish before both sides are dropped.
    /// An error in either direction closes both sides.
    ///
    /// Returns `(client_to_target, target_to_client)` byte counts, not
    /// counting anything read by earlier consumers.
    pub async fn pipe(mut self) -> Result<(u64, u64), ProxyError> {
        self.sm.enter(TunnelState::Piping);
        let (mut target_recv, mut target_send) = tokio::io::split(self.target);
        let res = {
            let mut client_recv = self.client.attach();
            forward_bidi(
                &mut client_recv,
                &mut self.client_send,
                &mut target_recv,
                &mut target_send,
                self.drain_timeout,
            )
            .await
        };
        self.sm.enter(TunnelState::Closed);
        match res {
            Ok((to_target, from_target)) => {
                debug!(authority = %self.authority, to_target, from_target, "tunnel closed");
                Ok((to_target, from_target))
            }
            Err(err) => {
                debug!(authority = %self.authority, "tunnel failed: {err:#}");
                Err(err.into())
            }
        }
    }

    /// Gives up the tunnel: client bytes, client write side, and target stream.
    pub fn into_parts(self) -> (HandoffBuffer<R>, W, T) {
        (self.client, self.client_send, self.target)
    }
}

#[cfg(test)]
mod tests {
    use std::{io, time::Duration};

    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;
    use crate::{
        auth::{AuthCallback, Denial, DenyAll},
        config::ProxyConfig,
    };

    /// Dialer handing out in-memory streams; the far ends go to the test.
    #[derive(Debug)]
    struct DuplexDialer {
        far_ends: tokio::sync::mpsc::UnboundedSender<DuplexStream>,
    }

    impl Dialer for DuplexDialer {
        type Stream = DuplexStream;

        async fn dial(&self, _authority: &Authority) -> io::Result<DuplexStream> {
            let (near, far) = duplex(1024);
            self.far_ends
                .send(far)
                .map_err(|_| io::Error::other("test dropped the receiver"))?;
            Ok(near)
        }
    }

    #[derive(Debug)]
    struct RefusingDialer;

    impl Dialer for RefusingDialer {
        type Stream = DuplexStream;

        async fn dial(&self, _authority: &Authority) -> io::Result<DuplexStream> {
            Err(io::ErrorKind::ConnectionRefused.into())
        }
    }

    fn connect_request() -> HttpRequest {
        HttpRequest::parse_with_len(
            b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n",
        )
        .unwrap()
        .unwrap()
        .1
    }

    fn target() -> Result<Authority, ProxyError> {
        Ok(Authority::from_authority_str("example.test:443").unwrap())
    }

    /// Client-side streams as the proxy sees them, plus the test's end.
    struct Client {
        test_end: DuplexStream,
        recv: HandoffBuffer<tokio::io::ReadHalf<DuplexStream>>,
        send: tokio::io::WriteHalf<DuplexStream>,
    }

    fn client() -> Client {
        let (test_end, proxy_end) = duplex(1024);
        let (recv, send) = tokio::io::split(proxy_end);
        Client {
            test_end,
            recv: HandoffBuffer::new(recv, 64 * 1024),
            send,
        }
    }

    #[test]
    fn transitions() {
        use TunnelState::*;
        assert!(Authenticating.can_enter(Dialing));
        assert!(Authenticating.can_enter(Rejected));
        assert!(Dialing.can_enter(DialFailed));
        assert!(Established.can_enter(Piping));
        assert!(Piping.can_enter(Closed));
        assert!(!Closed.can_enter(Dialing));
        assert!(!Closed.can_enter(Closed));
        assert!(!DialFailed.can_enter(Dialing));
        assert!(!Rejected.can_enter(Established));
        assert!(!Authenticating.can_enter(Established));
    }

    #[tokio::test]
    async fn established_tunnel_relays_bytes_sent_before_pipe() {
        let (tx, mut far_ends) = tokio::sync::mpsc::unbounded_channel();
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default()),
            Arc::new(DuplexDialer { far_ends: tx }),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        // Sent right behind the CONNECT head, before the tunnel exists.
        test_end.write_all(b"early ").await.unwrap();

        let tunnel = manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap();
        assert_eq!(tunnel.state(), TunnelState::Established);
        assert_eq!(tunnel.authority().to_addr(), "example.test:443");
        let mut far = far_ends.recv().await.unwrap();

        let mut status = vec![0u8; CONNECT_ESTABLISHED.len()];
        test_end.read_exact(&mut status).await.unwrap();
        assert_eq!(status, CONNECT_ESTABLISHED);

        let pipe = tokio::spawn(tunnel.pipe());
        test_end.write_all(b"late").await.unwrap();
        let mut got = [0u8; 10];
        far.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"early late");

        far.write_all(b"reply").await.unwrap();
        far.shutdown().await.unwrap();
        let mut reply = [0u8; 5];
        test_end.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");
        test_end.shutdown().await.unwrap();

        let (up, down) = pipe.await.unwrap().unwrap();
        assert_eq!((up, down), (10, 5));
    }

    #[tokio::test]
    async fn consumer_detach_before_pipe_loses_nothing() {
        let (tx, mut far_ends) = tokio::sync::mpsc::unbounded_channel();
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default()),
            Arc::new(DuplexDialer { far_ends: tx }),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        let mut tunnel = manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap();
        let mut far = far_ends.recv().await.unwrap();

        test_end
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        {
            // A consumer peeks at the first bytes, pauses, and lets go.
            let mut consumer = tunnel.client_mut().attach();
            let mut first = [0u8; 4];
            consumer.read_exact(&mut first).await.unwrap();
            assert_eq!(&first, b"POST");
            consumer.pause();
            consumer.detach_with(&first);
        }
        assert!(!tunnel.client_mut().is_paused());

        let pipe = tokio::spawn(tunnel.pipe());
        test_end
            .write_all(b"10\r\n{ \"foo\": \"bar\",\r\n")
            .await
            .unwrap();
        test_end.shutdown().await.unwrap();

        let mut got = Vec::new();
        far.read_to_end(&mut got).await.unwrap();
        assert_eq!(
            got,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n10\r\n{ \"foo\": \"bar\",\r\n"
        );
        far.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        far.shutdown().await.unwrap();

        let mut status = vec![0u8; CONNECT_ESTABLISHED.len()];
        test_end.read_exact(&mut status).await.unwrap();
        let mut rest = Vec::new();
        test_end.read_to_end(&mut rest).await.unwrap();
        assert!(rest.starts_with(b"HTTP/1.1 200 OK\r\n"));
        pipe.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn denied_connect_writes_407_and_closes() {
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default().auth(DenyAll)),
            Arc::new(RefusingDialer),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        let err = manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::Denied { status, .. } if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
        ));
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.unwrap();
        assert!(got.starts_with(b"HTTP/1.1 407"));
    }

    #[tokio::test]
    async fn hook_status_is_used_for_denial() {
        let hook = AuthCallback::new(|_req, decide| {
            decide
                .deny(Denial::with_status(StatusCode::FORBIDDEN))
                .unwrap();
        });
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default().auth(hook)),
            Arc::new(RefusingDialer),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap_err();
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.unwrap();
        assert!(got.starts_with(b"HTTP/1.1 403 Forbidden\r\n"));
    }

    #[tokio::test]
    async fn failed_hook_closes_without_response() {
        let hook = AuthCallback::new(|_req, _decide| {});
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default().auth(hook)),
            Arc::new(RefusingDialer),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        let err = manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::AuthFailed { .. }));
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn dial_failure_writes_502_and_closes() {
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default()),
            Arc::new(RefusingDialer),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        let err = manager
            .open(&connect_request(), target(), recv, send)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect { .. }));
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.unwrap();
        assert!(got.starts_with(b"HTTP/1.1 502 Bad Gateway\r\n"));
    }

    #[tokio::test]
    async fn malformed_target_is_checked_after_auth() {
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default()),
            Arc::new(RefusingDialer),
        );
        let Client {
            mut test_end,
            recv,
            send,
        } = client();
        let bad = Authority::from_authority_str("no-port").map_err(ProxyError::malformed_target);
        let err = manager
            .open(&connect_request(), bad, recv, send)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::MalformedTarget { .. }));
        let mut got = Vec::new();
        test_end.read_to_end(&mut got).await.unwrap();
        assert!(got.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn client_closing_during_auth_aborts() {
        let hook = AuthCallback::new(|_req, decide| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                decide.allow().ok();
            });
        });
        let manager = TunnelManager::new(
            AuthGate::new(&ProxyConfig::default().auth(hook)),
            Arc::new(RefusingDialer),
        );
        let Client {
            test_end,
            recv,
            send,
        } = client();
        drop(test_end);
        let err = tokio::time::timeout(
            Duration::from_secs(1),
            manager.open(&connect_request(), target(), recv, send),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, ProxyError::Io { .. }));
    }
}
