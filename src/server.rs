use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use n0_error::{Result, StdResultExt};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::{future::FutureExt, sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    auth::{AuthGate, watch_hook_violations},
    classify::{connect_target, ensure_not_self, forward_target},
    config::ProxyConfig,
    dial::{Dialer, TcpDialer},
    error::ProxyError,
    forward::ForwardRelay,
    handoff::HandoffBuffer,
    parse::{HttpRequest, HttpResponse},
    tunnel::TunnelManager,
};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Forward HTTP proxy over TCP.
///
/// Every accepted connection gets its own task. A connection carries a
/// sequence of forwarded requests, and may end with a CONNECT tunnel:
///
/// - **Forward requests** (`GET http://host/path`, or origin-form with a
///   `Host` header) are authenticated, then relayed to the origin by
///   [`ForwardRelay`]. The connection is kept open for the next request
///   when both sides allow it.
/// - **CONNECT** requests are handed to the [`TunnelManager`] together with
///   every byte the client has sent past the request head.
///
/// Cloning is cheap; clones share the configuration, the dialer, and the
/// set of running connections.
///
/// ```ignore
/// let listener = TcpListener::bind("127.0.0.1:8080").await?;
/// let proxy = ProxyServer::new(ProxyConfig::default().auth(my_hook));
/// proxy.serve(listener).await?;
/// ```
#[derive(derive_more::Debug)]
pub struct ProxyServer<D = TcpDialer> {
    config: ProxyConfig,
    forward: ForwardRelay<D>,
    tunnels: TunnelManager<D>,
    #[debug(skip)]
    conn_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl<D> Clone for ProxyServer<D> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            forward: self.forward.clone(),
            tunnels: self.tunnels.clone(),
            conn_id: self.conn_id.clone(),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
        }
    }
}

impl ProxyServer<TcpDialer> {
    /// Creates a proxy that dials origins and tunnel targets over TCP.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_dialer(config, TcpDialer::default())
    }
}

impl<D: Dialer> ProxyServer<D> {
    /// Creates a proxy that opens outbound streams through `dialer`.
    pub fn with_dialer(config: ProxyConfig, dialer: D) -> Self {
        let gate = AuthGate::new(&config);
        let dialer = Arc::new(dialer);
        Self {
            forward: ForwardRelay::new(
                gate.clone(),
                dialer.clone(),
                config.header_section_max_length,
            )
            .with_drain_timeout(config.drain_timeout),
            tunnels: TunnelManager::new(gate, dialer).with_drain_timeout(config.drain_timeout),
            config,
            conn_id: Default::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Accepts connections until [`ProxyServer::shutdown`] is called.
    ///
    /// Returns an error if accepting fails; connections already running are
    /// not affected.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        debug!(addr = ?listener.local_addr().ok(), "proxy listening");
        loop {
            let (stream, client_addr) = match listener
                .accept()
                .with_cancellation_token(&self.shutdown)
                .await
            {
                None => return Ok(()),
                Some(res) => res.std_context("failed to accept TCP connection")?,
            };
            let id = self.conn_id.fetch_add(1, Ordering::SeqCst);
            let this = self.clone();
            self.tasks.spawn(
                self.shutdown
                    .child_token()
                    .run_until_cancelled_owned(async move {
                        this.handle_connection(stream, client_addr).await;
                    })
                    .instrument(error_span!("conn", id, client = %client_addr)),
            );
        }
    }

    /// Stops accepting and waits a short while for running connections.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        debug!("shutting down ({} pending connections)", self.tasks.len());
        match self.tasks.wait().timeout(GRACEFUL_SHUTDOWN_TIMEOUT).await {
            Ok(_) => debug!("all connections closed cleanly"),
            Err(_) => debug!(
                remaining = self.tasks.len(),
                "not all connections closed in time, abort"
            ),
        }
    }

    /// Serves one client connection to completion and logs how it ended.
    ///
    /// The connection is dropped as soon as its authentication hook decides
    /// more than once.
    pub async fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        debug!(%client_addr, "accepted connection");
        let violation = CancellationToken::new();
        let conn = watch_hook_violations(violation.clone(), self.serve_connection(stream));
        let res = tokio::select! {
            biased;
            _ = violation.cancelled() => Err(ProxyError::protocol_violation(
                "authentication hook decided more than once",
            )),
            res = conn => res,
        };
        match res {
            Ok(()) => debug!("connection closed"),
            Err(err @ (ProxyError::Denied { .. } | ProxyError::Io { .. })) => {
                debug!("connection ended: {err:#}")
            }
            Err(err) => warn!("connection failed: {err:#}"),
        }
    }

    async fn serve_connection(&self, stream: TcpStream) -> Result<(), ProxyError> {
        stream.set_nodelay(true).ok();
        let local = stream.local_addr()?;
        let (recv, mut send) = stream.into_split();
        let mut client = HandoffBuffer::new(recv, self.config.effective_high_water());
        loop {
            let req = {
                let mut reader = client.attach();
                HttpRequest::read(&mut *reader, self.config.header_section_max_length).await
            };
            let req = match req {
                Ok(Some(req)) => req,
                Ok(None) => return Ok(()),
                Err(err) => {
                    if let Some(status) = err.response_status() {
                        HttpResponse::closing(status).write(&mut send).await.ok();
                    }
                    return Err(err);
                }
            };
            debug!(method = %req.method, target = %req.target, version = ?req.version, "request");

            if req.is_connect() {
                let target = connect_target(&req).and_then(|authority| {
                    ensure_not_self(&authority, local)?;
                    Ok(authority)
                });
                let tunnel = self.tunnels.open(&req, target, client, send).await?;
                tunnel.pipe().await?;
                return Ok(());
            }

            let target = forward_target(&req).and_then(|target| {
                ensure_not_self(&target.authority, local)?;
                Ok(target)
            });
            if !self
                .forward
                .relay(&req, target, &mut client, &mut send)
                .await?
            {
                send.shutdown().await.ok();
                return Ok(());
            }
        }
    }
}
