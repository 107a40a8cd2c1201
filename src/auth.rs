use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::{HeaderValue, StatusCode};
use n0_error::{AnyError, e};
use tokio::sync::oneshot;
use tokio_util::{future::FutureExt, sync::CancellationToken};
use tracing::{debug, error};

use crate::{
    config::ProxyConfig,
    error::ProxyError,
    parse::{Headers, HttpRequest, HttpResponse},
};

/// Outcome of an authentication hook.
///
/// Hook failures are not a decision; they are returned as errors and end
/// the request with [`ProxyError::AuthFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    Denied(Denial),
}

impl AuthDecision {
    /// Denies with a bare `407 Proxy Authentication Required`.
    pub fn deny() -> Self {
        Self::Denied(Denial::default())
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Response sent to a client whose request was denied.
///
/// Status, headers and body are taken as given. The status defaults to
/// `407 Proxy Authentication Required`.
#[derive(derive_more::Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub status: StatusCode,
    pub headers: Headers,
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
}

impl Default for Denial {
    fn default() -> Self {
        Self {
            status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

impl Denial {
    pub fn with_status(status: StatusCode) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the response written to the client.
    ///
    /// Adds `Content-Length` and `Connection: close` unless the hook set them;
    /// the connection is closed after a denial either way.
    pub fn to_response(&self) -> HttpResponse {
        let mut res = HttpResponse::new(self.status);
        res.headers = self.headers.clone();
        if !res.headers.contains("Content-Length") {
            res.headers
                .append("Content-Length", HeaderValue::from(self.body.len()));
        }
        if !res.headers.contains("Connection") {
            res.headers
                .append("Connection", HeaderValue::from_static("close"));
        }
        res.body = self.body.clone();
        res
    }
}

#[dynosaur(pub(crate) DynAuthHandler = dyn(box) AuthHandler)]
/// Decides whether a proxied request or tunnel may proceed.
///
/// The hook sees the full request head, including `Proxy-Authorization`
/// exactly as the client sent it. It may take as long as it needs; other
/// connections keep running, and the gate bounds the wait with
/// [`ProxyConfig::auth_timeout`].
pub trait AuthHandler: Send + Sync {
    /// Returns the decision for `req`, or an error if the hook itself failed.
    fn authenticate<'a>(
        &'a self,
        req: &'a HttpRequest,
    ) -> impl Future<Output = Result<AuthDecision, AnyError>> + Send + 'a;
}

/// Auth handler that denies every request with `407`.
#[derive(Debug, Default)]
pub struct DenyAll;

impl AuthHandler for DenyAll {
    async fn authenticate<'a>(&'a self, _req: &'a HttpRequest) -> Result<AuthDecision, AnyError> {
        Ok(AuthDecision::deny())
    }
}

/// Auth handler that allows every request.
///
/// Equivalent to configuring no hook at all.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl AuthHandler for AcceptAll {
    async fn authenticate<'a>(&'a self, _req: &'a HttpRequest) -> Result<AuthDecision, AnyError> {
        Ok(AuthDecision::Allowed)
    }
}

type DecisionSender = oneshot::Sender<Result<AuthDecision, AnyError>>;

tokio::task_local! {
    static HOOK_VIOLATION: CancellationToken;
}

/// Runs `fut` with `token` as the hook violation signal.
///
/// A [`Decide`] created while `fut` runs cancels `token` when the hook
/// decides a second time, so the caller can drop the connection.
pub(crate) async fn watch_hook_violations<F: Future>(
    token: CancellationToken,
    fut: F,
) -> F::Output {
    HOOK_VIOLATION.scope(token, fut).await
}

/// One-shot decider handed to an [`AuthCallback`] function.
///
/// Clones share the same decision slot. The first call to
/// [`allow`](Decide::allow), [`deny`](Decide::deny) or [`fail`](Decide::fail)
/// wins; any later call returns [`ProxyError::ProtocolViolation`] and makes
/// the proxy close the client connection the decision was for.
/// Dropping every clone without deciding fails the request.
#[derive(Debug, Clone)]
pub struct Decide {
    slot: Arc<Mutex<Option<DecisionSender>>>,
    violation: Option<CancellationToken>,
}

impl Decide {
    fn new(tx: DecisionSender) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(tx))),
            violation: HOOK_VIOLATION.try_with(CancellationToken::clone).ok(),
        }
    }

    pub fn allow(&self) -> Result<(), ProxyError> {
        self.decide(Ok(AuthDecision::Allowed))
    }

    pub fn deny(&self, denial: Denial) -> Result<(), ProxyError> {
        self.decide(Ok(AuthDecision::Denied(denial)))
    }

    pub fn fail(&self, err: impl Into<AnyError>) -> Result<(), ProxyError> {
        self.decide(Err(err.into()))
    }

    pub fn decide(&self, decision: Result<AuthDecision, AnyError>) -> Result<(), ProxyError> {
        let tx = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(tx) = tx else {
            error!("authentication hook decided more than once");
            if let Some(violation) = &self.violation {
                violation.cancel();
            }
            return Err(ProxyError::protocol_violation(
                "authentication hook decided more than once",
            ));
        };
        if tx.send(decision).is_err() {
            debug!("authentication decision arrived after the request was abandoned");
        }
        Ok(())
    }

    /// Returns true once a decision was made through any clone.
    pub fn is_decided(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Adapts a callback-style function to [`AuthHandler`].
///
/// The function is called once per request with a [`Decide`] handle and
/// returns immediately; the decision may be delivered later, from any task.
///
/// ```ignore
/// let hook = AuthCallback::new(|req, decide| {
///     if req.headers.get_str("Proxy-Authorization") == Some("Basic Zm9vOmJhcg==") {
///         decide.allow().ok();
///     } else {
///         decide.deny(Denial::default()).ok();
///     }
/// });
/// ```
#[derive(derive_more::Debug)]
#[debug("AuthCallback")]
pub struct AuthCallback<F> {
    f: F,
}

impl<F> AuthCallback<F>
where
    F: Fn(&HttpRequest, Decide) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> AuthHandler for AuthCallback<F>
where
    F: Fn(&HttpRequest, Decide) + Send + Sync,
{
    async fn authenticate<'a>(&'a self, req: &'a HttpRequest) -> Result<AuthDecision, AnyError> {
        let (tx, rx) = oneshot::channel();
        (self.f)(req, Decide::new(tx));
        match rx.await {
            Ok(decision) => decision,
            Err(_) => Err(n0_error::anyerr!(
                "authentication hook dropped its decider without deciding"
            )),
        }
    }
}

/// Runs the configured authentication hook for one request.
#[derive(derive_more::Debug, Clone)]
pub struct AuthGate {
    #[debug("{:?}", handler.as_ref().map(|_| "Arc<dyn AuthHandler>"))]
    handler: Option<Arc<DynAuthHandler<'static>>>,
    timeout: Duration,
}

impl AuthGate {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            handler: config.auth.clone(),
            timeout: config.auth_timeout,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.handler.is_some()
    }

    /// Produces exactly one decision for `req`.
    ///
    /// Without a hook this is [`AuthDecision::Allowed`] right away. Hook
    /// errors and timeouts are reported on the error log and returned as
    /// [`ProxyError::AuthFailed`] and [`ProxyError::AuthTimeout`].
    pub async fn check(&self, req: &HttpRequest) -> Result<AuthDecision, ProxyError> {
        let Some(handler) = &self.handler else {
            return Ok(AuthDecision::Allowed);
        };
        match handler.authenticate(req).timeout(self.timeout).await {
            Ok(Ok(decision)) => {
                if let AuthDecision::Denied(denial) = &decision {
                    debug!(
                        method = %req.method,
                        target = %req.target,
                        status = %denial.status,
                        "request denied"
                    );
                }
                Ok(decision)
            }
            Ok(Err(source)) => {
                error!(
                    method = %req.method,
                    target = %req.target,
                    "authentication hook failed: {source:#}"
                );
                Err(e!(ProxyError::AuthFailed { source }))
            }
            Err(_) => {
                error!(
                    method = %req.method,
                    target = %req.target,
                    timeout = ?self.timeout,
                    "authentication hook timed out"
                );
                Err(e!(ProxyError::AuthTimeout {
                    timeout: self.timeout
                }))
            }
        }
    }
}
