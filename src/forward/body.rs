//! HTTP/1.1 message body framing.
//!
//! Bodies are copied byte for byte. Chunked framing is parsed only to find
//! where the message ends; chunk lines, extensions and trailers are written
//! out unchanged.

use std::io;

use bytes::Bytes;
use http::{Method, StatusCode};
use n0_error::{Result, StdResultExt, anyerr, ensure_any};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    parse::{Headers, HttpResponse},
    util::Prebuffered,
};

/// Upper bound on a chunk-size line or trailer field.
const MAX_CHUNK_LINE: usize = 4096;

/// How the end of a message body is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyLength {
    Empty,
    Fixed(u64),
    Chunked,
    /// The body ends when the sender closes the connection.
    UntilClose,
}

/// Determines the framing of a request body.
pub(crate) fn request_body_length(headers: &Headers) -> Result<BodyLength> {
    if headers.contains("Transfer-Encoding") {
        ensure_any!(
            last_coding_is_chunked(headers),
            "Request Transfer-Encoding does not end in chunked"
        );
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(headers)? {
        None | Some(0) => BodyLength::Empty,
        Some(len) => BodyLength::Fixed(len),
    })
}

/// Determines the framing of a response body to a request with `method`.
pub(crate) fn response_body_length(method: &Method, res: &HttpResponse) -> Result<BodyLength> {
    if *method == Method::HEAD
        || res.status.is_informational()
        || res.status == StatusCode::NO_CONTENT
        || res.status == StatusCode::NOT_MODIFIED
    {
        return Ok(BodyLength::Empty);
    }
    if res.headers.contains("Transfer-Encoding") {
        return Ok(if last_coding_is_chunked(&res.headers) {
            BodyLength::Chunked
        } else {
            BodyLength::UntilClose
        });
    }
    Ok(match content_length(&res.headers)? {
        None => BodyLength::UntilClose,
        Some(0) => BodyLength::Empty,
        Some(len) => BodyLength::Fixed(len),
    })
}

fn last_coding_is_chunked(headers: &Headers) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .last()
        .is_some_and(|t| t.eq_ignore_ascii_case("chunked"))
}

/// Parses `Content-Length`. Repeated fields must all agree.
fn content_length(headers: &Headers) -> Result<Option<u64>> {
    let mut len = None;
    for value in headers.get_all("Content-Length") {
        let value = value.to_str().std_context("Invalid Content-Length")?;
        for part in value.split(',') {
            let parsed: u64 = part.trim().parse().std_context("Invalid Content-Length")?;
            ensure_any!(
                len.is_none_or(|len| len == parsed),
                "Conflicting Content-Length values"
            );
            len = Some(parsed);
        }
    }
    Ok(len)
}

/// Copies one message body from `reader` to `writer`.
///
/// Bytes after the end of the body stay buffered in `reader`.
/// Returns the number of bytes written, framing included.
pub(crate) async fn copy_body<R, W>(
    reader: &mut Prebuffered<R>,
    writer: &mut W,
    length: BodyLength,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = match length {
        BodyLength::Empty => 0,
        BodyLength::Fixed(len) => copy_exact(reader, writer, len).await?,
        BodyLength::Chunked => copy_chunked(reader, writer).await?,
        BodyLength::UntilClose => tokio::io::copy(reader, writer).await?,
    };
    writer.flush().await?;
    Ok(n)
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let n = tokio::io::copy(&mut reader.take(len), writer).await?;
    if n < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("Stream ended after {n} of {len} body bytes"),
        ));
    }
    Ok(n)
}

async fn copy_chunked<R, W>(reader: &mut Prebuffered<R>, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0;
    loop {
        let line = read_line(reader).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        let size = parse_chunk_size(&line)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
        if size == 0 {
            break;
        }
        // Chunk data plus its trailing CRLF.
        total += copy_exact(reader, writer, size + 2).await?;
    }
    // Trailer section, terminated by an empty line.
    loop {
        let line = read_line(reader).await?;
        writer.write_all(&line).await?;
        total += line.len() as u64;
        if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
            return Ok(total);
        }
    }
}

/// Takes one line, including its line terminator, out of `reader`.
async fn read_line<R: AsyncRead + Unpin>(reader: &mut Prebuffered<R>) -> io::Result<Bytes> {
    loop {
        if let Some(pos) = reader.buffer().iter().position(|b| *b == b'\n') {
            return Ok(reader.take_buffered(pos + 1));
        }
        if reader.len() >= MAX_CHUNK_LINE || reader.is_full() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Chunk line too long",
            ));
        }
        if reader.buffer_more().await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "Stream ended inside chunked body",
            ));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let line = std::str::from_utf8(line).std_context("Chunk size line is not UTF-8")?;
    let size = line
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .unwrap_or_default()
        .trim();
    ensure_any!(!size.is_empty(), "Empty chunk size");
    u64::from_str_radix(size, 16).map_err(|_| anyerr!("Invalid chunk size {size:?}"))
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn headers(fields: &[(&str, &'static str)]) -> Headers {
        fields
            .iter()
            .map(|(n, v)| (n.to_string(), HeaderValue::from_static(v)))
            .collect()
    }

    #[test]
    fn request_framing() {
        assert_eq!(
            request_body_length(&headers(&[])).unwrap(),
            BodyLength::Empty
        );
        assert_eq!(
            request_body_length(&headers(&[("content-length", "12")])).unwrap(),
            BodyLength::Fixed(12)
        );
        assert_eq!(
            request_body_length(&headers(&[
                ("Content-Length", "12"),
                ("Transfer-Encoding", "gzip, chunked")
            ]))
            .unwrap(),
            BodyLength::Chunked
        );
        assert!(request_body_length(&headers(&[("Transfer-Encoding", "gzip")])).is_err());
        assert!(request_body_length(&headers(&[("Content-Length", "x")])).is_err());
        assert!(
            request_body_length(&headers(&[("Content-Length", "1"), ("Content-Length", "2")]))
                .is_err()
        );
        assert_eq!(
            request_body_length(&headers(&[("Content-Length", "3, 3")])).unwrap(),
            BodyLength::Fixed(3)
        );
    }

    #[test]
    fn response_framing() {
        let mut res = HttpResponse::new(StatusCode::OK);
        assert_eq!(
            response_body_length(&Method::GET, &res).unwrap(),
            BodyLength::UntilClose
        );
        res.headers
            .append("Content-Length", HeaderValue::from_static("5"));
        assert_eq!(
            response_body_length(&Method::GET, &res).unwrap(),
            BodyLength::Fixed(5)
        );
        assert_eq!(
            response_body_length(&Method::HEAD, &res).unwrap(),
            BodyLength::Empty
        );
        for status in [
            StatusCode::CONTINUE,
            StatusCode::NO_CONTENT,
            StatusCode::NOT_MODIFIED,
        ] {
            let res = HttpResponse::new(status);
            assert_eq!(
                response_body_length(&Method::GET, &res).unwrap(),
                BodyLength::Empty
            );
        }
        let mut res = HttpResponse::new(StatusCode::OK);
        res.headers
            .append("Transfer-Encoding", HeaderValue::from_static("chunked"));
        assert_eq!(
            response_body_length(&Method::GET, &res).unwrap(),
            BodyLength::Chunked
        );
    }

    #[tokio::test]
    async fn chunked_body_is_copied_verbatim() {
        let body: &[u8] =
            b"10;ext=1\r\n{ \"foo\": \"bar\",\r\n\r\n3\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut data = body.to_vec();
        data.extend_from_slice(b"GET /next HTTP/1.1\r\n");
        let mut reader = Prebuffered::new(&data[..], 8192);
        let mut out = Vec::new();
        let n = copy_body(&mut reader, &mut out, BodyLength::Chunked)
            .await
            .unwrap();
        assert_eq!(out, body);
        assert_eq!(n, body.len() as u64);

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"GET /next HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn fixed_body_leaves_pipelined_bytes() {
        let data: &[u8] = b"helloGET";
        let mut reader = Prebuffered::new(data, 8192);
        reader.buffer_more().await.unwrap();
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyLength::Fixed(5))
            .await
            .unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.buffer(), b"GET");
    }

    #[tokio::test]
    async fn truncated_bodies_fail() {
        let data: &[u8] = b"abc";
        let mut reader = Prebuffered::new(data, 8192);
        let err = copy_body(&mut reader, &mut Vec::new(), BodyLength::Fixed(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);

        let data: &[u8] = b"5\r\nab";
        let mut reader = Prebuffered::new(data, 8192);
        let err = copy_body(&mut reader, &mut Vec::new(), BodyLength::Chunked)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn invalid_chunk_size_fails() {
        let data: &[u8] = b"zz\r\n";
        let mut reader = Prebuffered::new(data, 8192);
        let err = copy_body(&mut reader, &mut Vec::new(), BodyLength::Chunked)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn until_close_copies_everything() {
        let data: &[u8] = b"all of it";
        let mut reader = Prebuffered::new(data, 8192);
        let mut out = Vec::new();
        copy_body(&mut reader, &mut out, BodyLength::UntilClose)
            .await
            .unwrap();
        assert_eq!(out, b"all of it");
    }
}
