use std::str::FromStr;

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version,
    uri::{Scheme, Uri},
};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::{error::ProxyError, util::Prebuffered};

/// How much data to read for a request or response head before it's considered invalid.
pub const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Maximum number of header fields accepted in one head.
const MAX_HEADERS: usize = 100;

/// The literal reply to a successful CONNECT.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Host and port authority parsed from HTTP request targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme. IPv6 literals keep their brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form URI with no scheme and no path.
    ///
    /// Note: the URI must include a port.
    pub fn from_authority_uri(uri: &Uri) -> Result<Self> {
        ensure_any!(uri.scheme().is_none(), "Expected URI without scheme");
        ensure_any!(uri.path_and_query().is_none(), "Expected URI without path");
        let authority = uri.authority().context("Expected URI with authority")?;
        ensure_any!(
            !authority.as_str().contains('@'),
            "Expected authority without userinfo"
        );
        let host = authority.host();
        ensure_any!(!host.is_empty(), "Expected URI with host");
        let port = authority.port_u16().context("Expected URI with port")?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses an absolute-form URI and infers the port from the scheme.
    ///
    /// Note: if no port is present, only `http` and `https` schemes are accepted.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("Expected URI with authority")?;
        let host = authority.host();
        ensure_any!(!host.is_empty(), "Expected URI with host");
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("Expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parses the value of a `Host` header, using `default_port` if it has none.
    pub fn from_host_header(value: &str, default_port: u16) -> Result<Self> {
        let authority = http::uri::Authority::from_str(value.trim())
            .std_context("Invalid Host header")?;
        let host = authority.host();
        ensure_any!(!host.is_empty(), "Empty Host header");
        Ok(Self {
            host: host.to_string(),
            port: authority.port_u16().unwrap_or(default_port),
        })
    }

    /// Parses an authority-form request target from a string.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        Self::from_authority_uri(&Uri::from_str(s).std_context("Invalid authority string")?)
    }

    /// Parses an absolute-form request target from a string.
    pub fn from_absolute_uri_str(s: &str) -> Result<Self> {
        Self::from_absolute_uri(&Uri::from_str(s).std_context("Invalid absolute URI")?)
    }

    /// Returns the `host:port` string handed to the resolver.
    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ordered header fields.
///
/// Names keep the spelling they arrived with and compare case-insensitively.
/// Duplicate fields are kept, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, HeaderValue)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns the first value for `name` if it is visible ASCII.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns all values for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a field after all existing fields.
    pub fn append(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.0.push((name.into(), value));
    }

    /// Removes every field named `name` and returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.0.len();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Checks whether any comma-separated element of the `name` fields equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Converts to an [`http::HeaderMap`], dropping fields with invalid names.
    ///
    /// Note: the map does not preserve the relative order of different names.
    pub fn to_header_map(&self) -> HeaderMap {
        self.0
            .iter()
            .filter_map(|(n, v)| Some((HeaderName::from_bytes(n.as_bytes()).ok()?, v.clone())))
            .collect()
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        for (name, value) in self.0.iter() {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    fn from_httparse(headers: &[httparse::Header<'_>]) -> Self {
        headers
            .iter()
            .flat_map(|h| {
                let value = HeaderValue::from_bytes(h.value).ok()?;
                Some((h.name.to_string(), value))
            })
            .collect()
    }
}

impl FromIterator<(String, HeaderValue)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, HeaderValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parsed HTTP/1.x request head.
///
/// The request target is kept as sent; [`crate::classify`] interprets it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Request target exactly as it appeared on the request line.
    pub target: String,
    pub version: Version,
    pub headers: Headers,
}

impl HttpRequest {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// Returns true if the client expects the connection to stay open after the response.
    pub fn wants_keep_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Reads and parses the request line and header section.
    ///
    /// Does not remove the header section from `reader`.
    /// Returns `None` if the stream ends cleanly before any byte of a new request.
    pub async fn peek(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
        max_len: usize,
    ) -> Result<Option<(usize, Self)>, ProxyError> {
        loop {
            if !reader.is_empty()
                && let Some(request) = Self::parse_with_len(reader.buffer())?
            {
                return Ok(Some(request));
            }
            if reader.len() >= max_len || reader.is_full() {
                return Err(ProxyError::bad_request(anyerr!(
                    "Request header section exceeds {max_len} bytes"
                )));
            }
            if reader.buffer_more().await? == 0 {
                return if reader.is_empty() {
                    Ok(None)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "Stream ended inside request header section",
                    )
                    .into())
                };
            }
        }
    }

    /// Reads and parses the request line and header section.
    ///
    /// Removes the header section from `reader`; body bytes stay buffered.
    pub async fn read(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
        max_len: usize,
    ) -> Result<Option<Self>, ProxyError> {
        let Some((len, request)) = Self::peek(reader, max_len).await? else {
            return Ok(None);
        };
        reader.discard(len);
        Ok(Some(request))
    }

    /// Parses a request from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the request.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let header_len = match req
            .parse(buf)
            .std_context("Invalid HTTP request")
            .map_err(ProxyError::bad_request)?
        {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(header_len) => header_len,
        };
        Self::from_request(req)
            .map(|req| Some((header_len, req)))
            .map_err(ProxyError::bad_request)
    }

    fn from_request(req: httparse::Request) -> Result<Self> {
        let method = req.method.context("Missing HTTP method")?;
        let method = Method::from_bytes(method.as_bytes()).std_context("Invalid HTTP method")?;
        let target = req.path.context("Missing request target")?.to_string();
        let version = match req.version.context("Missing HTTP version")? {
            0 => Version::HTTP_10,
            _ => Version::HTTP_11,
        };
        Ok(Self {
            method,
            target,
            version,
            headers: Headers::from_httparse(req.headers),
        })
    }
}

/// HTTP/1.x response, either generated by the proxy or parsed from an origin.
#[derive(derive_more::Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    /// Status code from the response line.
    pub status: StatusCode,
    /// Reason phrase if present.
    pub reason: Option<String>,
    pub headers: Headers,
    #[debug("{} bytes", body.len())]
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_reason(status: StatusCode, reason: impl ToString) -> Self {
        Self {
            reason: Some(reason.to_string()),
            ..Self::new(status)
        }
    }

    /// Builds the empty-bodied response the proxy sends before closing a connection.
    pub fn closing(status: StatusCode) -> Self {
        let mut res = Self::new(status);
        res.headers
            .append("Content-Length", HeaderValue::from_static("0"));
        res.headers
            .append("Connection", HeaderValue::from_static("close"));
        res
    }

    /// Returns the reason phrase or a canonical reason if available.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or(self.status.canonical_reason())
            .unwrap_or("")
    }

    /// Formats a status line suitable for an HTTP/1.x response.
    pub fn status_line(&self) -> String {
        let version = if self.version == Version::HTTP_10 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        };
        format!("{version} {} {}\r\n", self.status.as_u16(), self.reason())
    }

    /// Serializes status line, headers and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(self.status_line().as_bytes());
        self.headers.encode(&mut out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    pub async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        writer.write_all(&self.to_bytes()).await?;
        writer.flush().await
    }

    /// Returns true if the origin lets the connection persist after this response.
    pub fn keeps_alive(&self) -> bool {
        keep_alive(self.version, &self.headers)
    }

    /// Parses a response from a buffer and returns `None` when incomplete.
    ///
    /// Returns the length of the header section and the response.
    pub fn parse_with_len(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut res = httparse::Response::new(&mut headers);
        match res
            .parse(buf)
            .std_context("Failed to parse HTTP response")?
        {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let code = res.code.context("Missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("Invalid response status code")?;
                let version = match res.version.context("Missing HTTP version")? {
                    0 => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                Ok(Some((
                    header_len,
                    HttpResponse {
                        version,
                        status,
                        reason: res.reason.map(ToOwned::to_owned),
                        headers: Headers::from_httparse(res.headers),
                        body: Bytes::new(),
                    },
                )))
            }
        }
    }

    /// Reads and parses the response status line and header section.
    ///
    /// Does not remove the header section from `reader`.
    pub async fn peek(
        reader: &mut Prebuffered<impl AsyncRead + Unpin>,
        max_len: usize,
    ) -> Result<(usize, Self)> {
        loop {
            if let Some(response) = Self::parse_with_len(reader.buffer())? {
                return Ok(response);
            }
            if reader.len() >= max_len || reader.is_full() {
                return Err(anyerr!("Response header section exceeds {max_len} bytes"));
            }
            if reader.buffer_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Origin closed before end of response header section",
                )
                .into());
            }
        }
    }
}

fn keep_alive(version: Version, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        false
    } else if version == Version::HTTP_10 {
        headers.has_token("Connection", "keep-alive")
    } else {
        true
    }
}
