//! Decides what a parsed request asks the proxy to do.

use std::{
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use http::{Uri, uri::Scheme};
use n0_error::{Result, StackResultExt, StdResultExt, e, ensure_any};

use crate::{
    error::ProxyError,
    parse::{Authority, HttpRequest},
};

/// Default port of forwarded `http` requests.
const HTTP_DEFAULT_PORT: u16 = 80;

/// What a request asks of the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// `CONNECT host:port`: open a raw tunnel.
    Connect(Authority),
    /// Relay the request to an origin.
    Forward(ForwardTarget),
}

/// Origin and rewritten request target of a forward request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub authority: Authority,
    /// Path and query to put on the outbound request line. Never empty.
    pub origin_form: String,
}

/// Classifies `req` without side effects.
///
/// `CONNECT` targets must be authority-form with an explicit port. Other
/// methods need an absolute `http` URI, or an origin-form path plus a `Host`
/// header. Anything else is [`ProxyError::MalformedTarget`].
pub fn classify(req: &HttpRequest) -> Result<RequestKind, ProxyError> {
    if req.is_connect() {
        connect_target(req).map(RequestKind::Connect)
    } else {
        forward_target(req).map(RequestKind::Forward)
    }
}

/// Resolves the authority of a `CONNECT` request.
pub fn connect_target(req: &HttpRequest) -> Result<Authority, ProxyError> {
    Authority::from_authority_str(&req.target).map_err(ProxyError::malformed_target)
}

/// Resolves the origin and origin-form target of a forward request.
pub fn forward_target(req: &HttpRequest) -> Result<ForwardTarget, ProxyError> {
    resolve_forward(req).map_err(ProxyError::malformed_target)
}

/// Fails with [`ProxyError::Loop`] if `authority` names `local`, the
/// address the client reached the proxy on.
///
/// Loopback hosts (including `localhost`) match a loopback `local` on the
/// same port. Other hostnames are not resolved.
pub fn ensure_not_self(authority: &Authority, local: SocketAddr) -> Result<(), ProxyError> {
    if targets_self(authority, local) {
        return Err(e!(ProxyError::Loop {
            authority: authority.clone()
        }));
    }
    Ok(())
}

fn targets_self(authority: &Authority, local: SocketAddr) -> bool {
    if authority.port != local.port() {
        return false;
    }
    let host = authority.host.trim_start_matches('[').trim_end_matches(']');
    match host.parse::<IpAddr>() {
        Ok(ip) => {
            ip == local.ip()
                || ip.is_unspecified()
                || (ip.is_loopback() && local.ip().is_loopback())
        }
        Err(_) => host.eq_ignore_ascii_case("localhost") && local.ip().is_loopback(),
    }
}

fn resolve_forward(req: &HttpRequest) -> Result<ForwardTarget> {
    if req.target.starts_with('/') {
        let host = req
            .headers
            .get_str("Host")
            .context("Origin-form request without Host header")?;
        return Ok(ForwardTarget {
            authority: Authority::from_host_header(host, HTTP_DEFAULT_PORT)?,
            origin_form: req.target.clone(),
        });
    }
    let uri = Uri::from_str(&req.target).std_context("Invalid request target")?;
    let scheme = uri.scheme().context("Expected absolute-form request target")?;
    ensure_any!(
        *scheme == Scheme::HTTP,
        "Unsupported scheme {scheme} in request target"
    );
    let authority = Authority::from_absolute_uri(&uri)?;
    let origin_form = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/");
    // `http` renders a bare query as "?q"; the request line needs "/?q".
    let origin_form = if origin_form.starts_with('/') {
        origin_form.to_string()
    } else {
        format!("/{origin_form}")
    };
    Ok(ForwardTarget {
        authority,
        origin_form,
    })
}
