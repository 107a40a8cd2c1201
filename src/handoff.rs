//! Ordered buffering of client bytes across changes of consumer.
//!
//! A client socket is read by several consumers over its lifetime: the
//! request-head parser, a body relay, a tunnel pipe, or external code that
//! takes the stream over. Between consumers nobody is reading, but the
//! socket keeps receiving. [`HandoffBuffer`] queues those bytes, in order,
//! and hands them to the next consumer before any live byte.
//!
//! A consumer is attached with [`HandoffBuffer::attach`], which returns an
//! [`Attached`] guard. Dropping the guard detaches the consumer and always
//! puts the buffer back into [`Flow::Flowing`], so a consumer that paused
//! reading can never leave the socket stalled for the next one.

use std::{
    future::Future,
    io,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::{debug, trace};

use crate::util::Prebuffered;

/// Whether the buffer currently pulls bytes from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Flow {
    /// Bytes are read from the transport into the queue while detached.
    Flowing,
    /// Reading from the transport is suspended. Unread bytes stay with the
    /// operating system, whose flow control then throttles the peer.
    Paused,
}

/// Queue of client bytes that arrived while no consumer was reading.
///
/// See the [module docs](self) for the attach/detach contract.
#[derive(Debug)]
pub struct HandoffBuffer<R> {
    inner: Prebuffered<R>,
    flow: Flow,
    eof: bool,
}

impl<R> HandoffBuffer<R> {
    pub fn flow(&self) -> Flow {
        self.flow
    }

    pub fn is_paused(&self) -> bool {
        self.flow == Flow::Paused
    }

    /// Returns true once the transport reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Stops reading from the transport until [`HandoffBuffer::resume`].
    pub fn pause(&mut self) {
        if self.flow == Flow::Flowing {
            trace!("handoff paused");
            self.flow = Flow::Paused;
        }
    }

    /// Lets the buffer read from the transport again.
    pub fn resume(&mut self) {
        if self.flow == Flow::Paused {
            trace!("handoff resumed");
            self.flow = Flow::Flowing;
        }
    }
}

impl<R: AsyncRead + Unpin> HandoffBuffer<R> {
    /// Wraps `reader`; reading pauses once `high_water` bytes are queued.
    pub fn new(reader: R, high_water: usize) -> Self {
        Self {
            inner: Prebuffered::new(reader, high_water),
            flow: Flow::Flowing,
            eof: false,
        }
    }

    /// Bytes queued for the next consumer, oldest first.
    pub fn pending(&self) -> &[u8] {
        self.inner.buffer()
    }

    pub fn high_water(&self) -> usize {
        self.inner.max_len()
    }

    /// Reads once from the transport into the queue.
    ///
    /// Pauses when the queue reaches the high-water mark. Returns `Ok(0)`
    /// without touching the transport while paused or after EOF.
    /// Cancel safe: if the future is dropped, no bytes were read.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.is_paused() || self.eof {
            return Ok(0);
        }
        let n = self.inner.buffer_more().await?;
        if self.inner.is_full() {
            self.pause();
        } else if n == 0 {
            debug!(pending = self.inner.len(), "client reached EOF while detached");
            self.eof = true;
        }
        Ok(n)
    }

    /// Drives `fut` to completion while queueing bytes from the transport.
    ///
    /// Fails with [`io::ErrorKind::ConnectionAborted`] if the client closes
    /// first, in which case `fut` is dropped without completing.
    pub async fn buffer_while<F: Future>(&mut self, fut: F) -> io::Result<F::Output> {
        tokio::pin!(fut);
        loop {
            let can_fill = !self.is_paused() && !self.eof;
            tokio::select! {
                biased;
                out = &mut fut => return Ok(out),
                res = self.fill(), if can_fill => {
                    res?;
                    if self.eof {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionAborted,
                            "client closed the connection",
                        ));
                    }
                }
            }
        }
    }

    /// Attaches a consumer.
    ///
    /// The returned guard first yields every queued byte, then reads the
    /// transport directly. Dropping it detaches and resumes the buffer.
    pub fn attach(&mut self) -> Attached<'_, R> {
        trace!(pending = self.inner.len(), flow = %self.flow, "handoff attached");
        Attached { buf: self }
    }

    /// Returns the queued bytes and the transport.
    pub fn into_parts(self) -> (Bytes, R) {
        self.inner.into_parts()
    }
}

/// A consumer attached to a [`HandoffBuffer`].
///
/// Reads drain the queue before the transport. Dereferences to the
/// underlying [`Prebuffered`] for consumers that parse in place.
#[derive(Debug)]
pub struct Attached<'a, R> {
    buf: &'a mut HandoffBuffer<R>,
}

impl<R> Attached<'_, R> {
    /// Marks the transport as paused, e.g. while the consumer's sink is busy.
    ///
    /// Detaching undoes this.
    pub fn pause(&mut self) {
        self.buf.pause();
    }

    pub fn is_paused(&self) -> bool {
        self.buf.is_paused()
    }

    /// Detaches the consumer. Same as dropping the guard.
    pub fn detach(self) {}
}

impl<R: AsyncRead + Unpin> Attached<'_, R> {
    /// Detaches, pushing bytes the consumer read but did not use back in
    /// front of the queue.
    pub fn detach_with(self, unconsumed: &[u8]) {
        self.buf.inner.unread(unconsumed);
    }
}

impl<R> Drop for Attached<'_, R> {
    fn drop(&mut self) {
        self.buf.resume();
        trace!("handoff detached");
    }
}

impl<R> Deref for Attached<'_, R> {
    type Target = Prebuffered<R>;

    fn deref(&self) -> &Self::Target {
        &self.buf.inner
    }
}

impl<R> DerefMut for Attached<'_, R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Attached<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = out.filled().len();
        let wanted = out.remaining() > 0;
        let res = Pin::new(&mut this.buf.inner).poll_read(cx, out);
        if let Poll::Ready(Ok(())) = &res
            && wanted
            && out.filled().len() == before
        {
            this.buf.eof = true;
        }
        res
    }
}
