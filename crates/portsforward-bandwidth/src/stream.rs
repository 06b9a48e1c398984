//! Throttled connection halves
//!
//! Reads are charged after they complete: the bytes are handed out at once and
//! the next read waits until the debt is paid. Writes are charged up front, at
//! most one burst at a time. Each charge debits the connection budget first and
//! the listener-wide budget second.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::rate::Budget;

/// The budgets one direction of a connection is charged against
struct Throttle {
    budgets: Arc<Vec<Budget>>,
    max_chunk: usize,
    pending: Option<BoxFuture<'static, ()>>,
}

impl Throttle {
    fn new(budgets: Vec<Budget>) -> Self {
        let max_chunk = budgets
            .iter()
            .map(Budget::burst)
            .min()
            .unwrap_or(usize::MAX);
        Self {
            budgets: Arc::new(budgets),
            max_chunk,
            pending: None,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.budgets.is_empty()
    }

    fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn charge(&mut self, bytes: usize) {
        if bytes == 0 || self.is_unlimited() {
            return;
        }
        let budgets = self.budgets.clone();
        self.pending = Some(Box::pin(async move {
            for budget in budgets.iter() {
                budget.acquire(bytes).await;
            }
        }));
    }

    fn poll_paid(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(fut) = self.pending.as_mut() {
            ready!(fut.as_mut().poll(cx));
            self.pending = None;
        }
        Poll::Ready(())
    }
}

/// Read side throttled against its budgets
pub struct ThrottledReader<R> {
    inner: R,
    throttle: Throttle,
}

impl<R> ThrottledReader<R> {
    pub fn new(inner: R, budgets: Vec<Budget>) -> Self {
        Self {
            inner,
            throttle: Throttle::new(budgets),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.throttle.poll_paid(cx));

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.throttle.charge(buf.filled().len() - before);

        Poll::Ready(Ok(()))
    }
}

/// Write side throttled against its budgets
pub struct ThrottledWriter<W> {
    inner: W,
    throttle: Throttle,
    /// Bytes already paid for but not yet written
    credit: usize,
    reserved: usize,
}

impl<W> ThrottledWriter<W> {
    pub fn new(inner: W, budgets: Vec<Budget>) -> Self {
        Self {
            inner,
            throttle: Throttle::new(budgets),
            credit: 0,
            reserved: 0,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() || this.throttle.is_unlimited() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }

        if this.credit == 0 {
            if !this.throttle.is_pending() {
                let chunk = buf.len().min(this.throttle.max_chunk);
                this.throttle.charge(chunk);
                this.reserved = chunk;
            }
            ready!(this.throttle.poll_paid(cx));
            this.credit = this.reserved;
        }

        let len = buf.len().min(this.credit);
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..len]))?;
        this.credit -= n;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

pub type RateLimitedReadHalf = ThrottledReader<OwnedReadHalf>;
pub type RateLimitedWriteHalf = ThrottledWriter<OwnedWriteHalf>;

/// Accepted TCP connection with throttled reads and writes
pub struct RateLimitedStream {
    reader: RateLimitedReadHalf,
    writer: RateLimitedWriteHalf,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl RateLimitedStream {
    /// Wrap `stream`, charging reads to `read_budgets` and writes to `write_budgets`
    pub fn new(
        stream: TcpStream,
        read_budgets: Vec<Budget>,
        write_budgets: Vec<Budget>,
    ) -> io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: ThrottledReader::new(read_half, read_budgets),
            writer: ThrottledWriter::new(write_half, write_budgets),
            peer_addr,
            local_addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Split into halves that keep their throttling
    pub fn into_split(self) -> (RateLimitedReadHalf, RateLimitedWriteHalf) {
        (self.reader, self.writer)
    }
}

impl AsyncRead for RateLimitedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for RateLimitedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
