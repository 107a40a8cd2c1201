//! A manually controllable read-ahead buffer for Tokio `AsyncRead`.
//!
//! [`Prebuffered`] accumulates bytes from an inner reader so that HTTP heads
//! and chunk-size lines can be inspected in place. Whatever is not consumed
//! stays queued and is handed out first by the `AsyncRead` impl, so no bytes
//! are lost when a parser hands the stream on to a byte relay.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{self, AsyncRead, AsyncReadExt, ReadBuf};

/// Initial capacity for the internal buffer.
const INITIAL_CAPACITY: usize = 4 * 1024;

/// A read-ahead wrapper around an `AsyncRead`.
///
/// `max_len` caps how much [`Prebuffered::buffer_more`] pulls from the inner
/// reader. Bytes pushed back with [`Prebuffered::unread`] may exceed it.
#[derive(Debug)]
pub struct Prebuffered<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> Prebuffered<R> {
    /// Creates a new `Prebuffered` wrapper.
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY.min(max_len)),
            max_len,
        }
    }

    #[cfg(test)]
    pub(crate) fn unlimited(inner: R) -> Self {
        Self::new(inner, usize::MAX)
    }

    /// Returns the unconsumed buffered bytes.
    pub fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns true once the buffer holds `max_len` bytes or more.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.max_len
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Discards `n` bytes from the front of the buffer.
    pub fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        let _ = self.buf.split_to(n);
    }

    /// Removes and returns up to `n` bytes from the front of the buffer.
    pub fn take_buffered(&mut self, n: usize) -> Bytes {
        let n = n.min(self.buf.len());
        self.buf.split_to(n).freeze()
    }

    /// Pushes bytes back to the front of the buffer.
    ///
    /// They are returned before anything that is already queued.
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut buf = BytesMut::with_capacity(data.len() + self.buf.len());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&self.buf);
        self.buf = buf;
    }

    /// Buffers more data from the inner reader.
    ///
    /// Returns `Ok(0)` on EOF, and also when the buffer is already full.
    /// This is cancel safe: if the future is dropped, no data was read.
    pub async fn buffer_more(&mut self) -> io::Result<usize> {
        let max = self.max_len.saturating_sub(self.buf.len());
        if max == 0 {
            return Ok(0);
        }
        let n = (&mut self.inner)
            .take(max as u64)
            .read_buf(&mut self.buf)
            .await?;
        Ok(n)
    }

    /// Returns the buffer and the inner reader.
    pub fn into_parts(self) -> (Bytes, R) {
        (self.buf.freeze(), self.inner)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Prebuffered<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !out.has_remaining_mut() {
            Poll::Ready(Ok(()))
        } else if !self.buf.is_empty() {
            let n = self.buf.len().min(out.remaining_mut());
            let chunk = self.buf.split_to(n);
            out.put_slice(&chunk);
            Poll::Ready(Ok(()))
        } else {
            Pin::new(&mut self.inner).poll_read(cx, out)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn cursor(data: &'static [u8]) -> Cursor<&'static [u8]> {
        Cursor::new(data)
    }

    #[tokio::test]
    async fn buffer_more_stops_at_max_len() {
        let mut p = Prebuffered::new(cursor(b"abcdefgh"), 3);
        assert_eq!(p.buffer_more().await.unwrap(), 3);
        assert!(p.is_full());
        // A full buffer reports zero without touching the reader.
        assert_eq!(p.buffer_more().await.unwrap(), 0);
        assert_eq!(p.buffer(), b"abc");
    }

    #[tokio::test]
    async fn buffer_more_eof() {
        let mut p = Prebuffered::unlimited(cursor(b""));
        assert_eq!(p.buffer_more().await.unwrap(), 0);
        assert!(p.is_empty());
    }

    #[tokio::test]
    async fn discard_beyond_len_is_clamped() {
        let mut p = Prebuffered::unlimited(cursor(b"abc"));
        p.buffer_more().await.unwrap();
        p.discard(10);
        assert_eq!(p.buffer(), b"");
        assert_eq!(p.buffer_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_drains_buffer_before_inner() {
        let mut p = Prebuffered::new(cursor(b"abcdef"), 4);
        p.buffer_more().await.unwrap();
        p.discard(2);
        assert_eq!(p.buffer(), b"cd");

        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdef");
    }

    #[tokio::test]
    async fn unread_goes_in_front_of_queued_bytes() {
        let mut p = Prebuffered::new(cursor(b"cdef"), 2);
        p.buffer_more().await.unwrap();
        assert_eq!(p.buffer(), b"cd");
        p.unread(b"ab");
        assert_eq!(p.buffer(), b"abcd");
        assert!(p.is_full());

        let mut out = Vec::new();
        p.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }

    #[tokio::test]
    async fn take_buffered_splits_front() {
        let mut p = Prebuffered::unlimited(cursor(b"hello world"));
        p.buffer_more().await.unwrap();
        assert_eq!(&p.take_buffered(5)[..], b"hello");
        assert_eq!(p.buffer(), b" world");
        assert_eq!(&p.take_buffered(100)[..], b" world");
        assert!(p.is_empty());
    }
}
