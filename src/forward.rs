use std::{sync::Arc, time::Duration};

use http::{HeaderValue, StatusCode, Version};
use n0_error::{StdResultExt, e};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::{
    auth::{AuthDecision, AuthGate},
    classify::ForwardTarget,
    config::DEFAULT_DRAIN_TIMEOUT,
    dial::Dialer,
    error::ProxyError,
    handoff::HandoffBuffer,
    parse::{Headers, HttpRequest, HttpResponse},
    util::{Prebuffered, forward_bidi},
};

use self::body::{BodyLength, copy_body, request_body_length, response_body_length};

mod body;

/// Headers meaningful only between the client and this proxy.
const PROXY_HOP_HEADERS: &[&str] = &["Proxy-Authorization", "Proxy-Connection"];

/// Relays absolute-form (and Host-addressed origin-form) requests to origins.
///
/// Each exchange dials a fresh origin connection, which is closed when the
/// exchange ends. The request head is rewritten to origin-form; everything
/// else is passed through unchanged, in order.
#[derive(derive_more::Debug)]
pub struct ForwardRelay<D> {
    gate: AuthGate,
    #[debug(skip)]
    dialer: Arc<D>,
    header_section_max_length: usize,
    drain_timeout: Duration,
}

impl<D> Clone for ForwardRelay<D> {
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            dialer: self.dialer.clone(),
            header_section_max_length: self.header_section_max_length,
            drain_timeout: self.drain_timeout,
        }
    }
}

/// Progress of one exchange, used to decide what may still be written to the client.
#[derive(Debug, Default)]
struct Exchange {
    response_started: bool,
}

impl<D: Dialer> ForwardRelay<D> {
    pub fn new(gate: AuthGate, dialer: Arc<D>, header_section_max_length: usize) -> Self {
        Self {
            gate,
            dialer,
            header_section_max_length,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    /// Sets how long an upgraded connection keeps relaying after one side closed.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Authenticates and relays one request and its response.
    ///
    /// `client` must be positioned at the start of the request body. On
    /// return it is positioned after the body, so a following request can be
    /// read from it.
    ///
    /// Returns whether the client connection may carry another request.
    /// On error, the status from [`ProxyError::response_status`] has already
    /// been sent unless part of the origin's response had been relayed, and
    /// the connection must be closed.
    pub async fn relay<R, W>(
        &self,
        req: &HttpRequest,
        target: Result<ForwardTarget, ProxyError>,
        client: &mut HandoffBuffer<R>,
        client_send: &mut W,
    ) -> Result<bool, ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut exchange = Exchange::default();
        match self
            .exchange(req, target, client, client_send, &mut exchange)
            .await
        {
            Ok(keep_alive) => Ok(keep_alive),
            Err(err) => {
                if !exchange.response_started
                    && let Some(status) = err.response_status()
                {
                    debug!(%status, "forward failed: {err:#}");
                    HttpResponse::closing(status)
                        .write(client_send)
                        .await
                        .inspect_err(|err| warn!("failed to write error response: {err:#}"))
                        .ok();
                }
                Err(err)
            }
        }
    }

    async fn exchange<R, W>(
        &self,
        req: &HttpRequest,
        target: Result<ForwardTarget, ProxyError>,
        client: &mut HandoffBuffer<R>,
        client_send: &mut W,
        exchange: &mut Exchange,
    ) -> Result<bool, ProxyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let AuthDecision::Denied(denial) = client.buffer_while(self.gate.check(req)).await?? {
            exchange.response_started = true;
            denial.to_response().write(client_send).await?;
            return Err(e!(ProxyError::Denied {
                status: denial.status
            }));
        }
        let target = target?;
        let body_length = request_body_length(&req.headers).map_err(ProxyError::bad_request)?;
        let head = origin_request_head(req, &target, body_length)?;

        let origin = client
            .buffer_while(self.dialer.dial(&target.authority))
            .await?
            .map_err(|source| {
                e!(ProxyError::Connect {
                    authority: target.authority.clone(),
                    source
                })
            })?;
        debug!(
            authority = %target.authority,
            method = %req.method,
            path = %target.origin_form,
            "forwarding"
        );
        let (origin_recv, mut origin_send) = tokio::io::split(origin);
        origin_send.write_all(&head).await?;

        let mut origin_recv = Prebuffered::new(origin_recv, self.header_section_max_length);
        let response = {
            let relay = self.relay_response(req, &mut origin_recv, client_send, exchange);
            tokio::pin!(relay);
            // The upload and the response run together; origins may answer early.
            let early = {
                let mut upload = client.attach();
                let copy = copy_body(&mut *upload, &mut origin_send, body_length);
                tokio::pin!(copy);
                tokio::select! {
                    res = &mut copy => {
                        res?;
                        None
                    }
                    res = &mut relay => {
                        let response = res?;
                        copy.await?;
                        Some(response)
                    }
                }
            };
            match early {
                Some(response) => response,
                // Only the response is pending now; watch the client so that a
                // disconnect drops the origin connection.
                None => client.buffer_while(&mut relay).await??,
            }
        };

        if response.status == StatusCode::SWITCHING_PROTOCOLS {
            debug!("origin switched protocols, relaying opaque bytes");
            let mut attached = client.attach();
            let (up, down) = forward_bidi(
                &mut attached,
                client_send,
                &mut origin_recv,
                &mut origin_send,
                self.drain_timeout,
            )
            .await?;
            debug!(to_origin = up, from_origin = down, "upgraded connection closed");
            return Ok(false);
        }

        let keep_alive = req.wants_keep_alive()
            && response.keep_alive
            && response.body != BodyLength::UntilClose;
        debug!(status = %response.status, keep_alive, "forward complete");
        Ok(keep_alive)
    }

    /// Relays interim responses, then the final response head and body.
    async fn relay_response<O, W>(
        &self,
        req: &HttpRequest,
        origin: &mut Prebuffered<O>,
        client_send: &mut W,
        exchange: &mut Exchange,
    ) -> Result<RelayedResponse, ProxyError>
    where
        O: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let (head_len, res) = HttpResponse::peek(origin, self.header_section_max_length)
                .await
                .map_err(ProxyError::invalid_response)?;
            exchange.response_started = true;
            client_send
                .write_all(&origin.take_buffered(head_len))
                .await?;
            if res.status.is_informational() && res.status != StatusCode::SWITCHING_PROTOCOLS {
                client_send.flush().await?;
                continue;
            }
            let body = if res.status == StatusCode::SWITCHING_PROTOCOLS {
                BodyLength::Empty
            } else {
                response_body_length(&req.method, &res).map_err(ProxyError::invalid_response)?
            };
            copy_body(origin, client_send, body).await?;
            return Ok(RelayedResponse {
                status: res.status,
                keep_alive: res.keeps_alive(),
                body,
            });
        }
    }
}

#[derive(Debug)]
struct RelayedResponse {
    status: StatusCode,
    keep_alive: bool,
    body: BodyLength,
}

/// Builds the request head sent to the origin.
///
/// The request line is rewritten to origin-form. Proxy hop headers are
/// dropped and a `Host` header is added if the client sent none.
fn origin_request_head(
    req: &HttpRequest,
    target: &ForwardTarget,
    body_length: BodyLength,
) -> Result<Vec<u8>, ProxyError> {
    let mut headers: Headers = req
        .headers
        .iter()
        .filter(|(name, _)| {
            !PROXY_HOP_HEADERS
                .iter()
                .any(|hop| hop.eq_ignore_ascii_case(name))
        })
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    if body_length == BodyLength::Chunked {
        // Chunked framing takes precedence; a stale length must not reach the origin.
        headers.remove("Content-Length");
    }
    if !headers.contains("Host") {
        let host = if target.authority.port == 80 {
            target.authority.host.clone()
        } else {
            target.authority.to_string()
        };
        let value = HeaderValue::from_str(&host)
            .std_context("Invalid Host")
            .map_err(ProxyError::malformed_target)?;
        headers.append("Host", value);
    }

    let version = if req.version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    };
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!("{} {} {version}\r\n", req.method, target.origin_form).as_bytes(),
    );
    headers.encode(&mut out);
    out.extend_from_slice(b"\r\n");
    Ok(out)
}
