//! Bidirectional byte pump between a client connection and its upstream.
//!
//! Each forwarded connection runs the two directions inside one future.
//! Either side reaching EOF (or failing) shuts the opposite writer down
//! after its pending bytes are drained, and a configurable idle window with
//! no traffic in either direction completes the transfer rather than
//! failing it. Byte counts accumulate into shared counters so the record
//! sink sees progress even when the pump ends with an error.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::ready;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::utils::buf_pool::{self, PooledBuf};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared per-connection byte counters, client->upstream and back.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub up: AtomicU64,
    pub down: AtomicU64,
}

impl TrafficCounters {
    pub fn snapshot(&self) -> (u64, u64) {
        (self.up.load(Ordering::Relaxed), self.down.load(Ordering::Relaxed))
    }
}

/// How the pump ended when it did not fail outright.
#[derive(Debug, PartialEq, Eq)]
pub enum CopyOutcome {
    /// One side closed and its counterpart was drained and shut down.
    PeerClosed,
    /// Neither direction moved bytes within the idle window.
    IdleTimeout,
}

struct CopyBuffer {
    read_done: bool,
    need_flush: bool,
    cache_length: usize,
    cache_start: usize,
    buf: PooledBuf,
    transferred: u64,
}

impl CopyBuffer {
    fn new() -> Self {
        Self {
            read_done: false,
            need_flush: false,
            cache_length: 0,
            cache_start: 0,
            buf: buf_pool::get_buf(),
            transferred: 0,
        }
    }

    fn poll_copy<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            let mut read_pending = false;
            let mut write_pending = false;

            if !self.read_done && self.cache_length == 0 {
                let mut buf = ReadBuf::new(self.buf.as_mut_slice());
                match reader.as_mut().poll_read(cx, &mut buf) {
                    Poll::Ready(val) => {
                        val?;
                        let n = buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cache_length = n;
                            self.cache_start = 0;
                            self.transferred = self.transferred.wrapping_add(n as u64);
                        }
                    }
                    Poll::Pending => read_pending = true,
                }
            }

            while self.cache_length > 0 {
                let slice =
                    &self.buf.as_mut_slice()[self.cache_start..self.cache_start + self.cache_length];
                match writer.as_mut().poll_write(cx, slice) {
                    Poll::Ready(val) => {
                        let n = val?;
                        if n == 0 {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "write zero bytes to peer",
                            )));
                        }
                        self.cache_start += n;
                        self.cache_length -= n;
                        self.need_flush = true;
                    }
                    Poll::Pending => {
                        write_pending = true;
                        break;
                    }
                }
            }

            if self.need_flush && self.cache_length == 0 {
                ready!(writer.as_mut().poll_flush(cx))?;
                self.need_flush = false;
                continue;
            }

            // All written and EOF observed: this direction is finished.
            if self.read_done && self.cache_length == 0 {
                return Poll::Ready(Ok(()));
            }

            if read_pending || write_pending {
                return Poll::Pending;
            }
        }
    }
}

#[derive(Debug, PartialEq)]
enum TransferState {
    Running,
    ShuttingDown,
    Done,
}

fn transfer_one_direction<A, B>(
    cx: &mut Context<'_>,
    state: &mut TransferState,
    buf: &mut CopyBuffer,
    r: &mut A,
    w: &mut B,
) -> Poll<io::Result<()>>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut r = Pin::new(r);
    let mut w = Pin::new(w);

    loop {
        match state {
            TransferState::Running => {
                ready!(buf.poll_copy(cx, r.as_mut(), w.as_mut()))?;
                *state = TransferState::ShuttingDown;
            }
            TransferState::ShuttingDown => {
                ready!(w.as_mut().poll_shutdown(cx))?;
                *state = TransferState::Done;
            }
            TransferState::Done => return Poll::Ready(Ok(())),
        }
    }
}

pin_project! {
    struct CopyBidirectional<'a, A: ?Sized, B: ?Sized> {
        a: &'a mut A,
        b: &'a mut B,
        a_buf: CopyBuffer,
        b_buf: CopyBuffer,
        a_to_b: TransferState,
        b_to_a: TransferState,
        counters: Arc<TrafficCounters>,
        idle_timeout: Duration,
        #[pin]
        idle_sleep: Sleep,
    }
}

impl<A, B> Future for CopyBidirectional<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = io::Result<CopyOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        let a_before = this.a_buf.transferred;
        let b_before = this.b_buf.transferred;

        let a_to_b = transfer_one_direction(cx, this.a_to_b, this.a_buf, *this.a, *this.b);
        let b_to_a = transfer_one_direction(cx, this.b_to_a, this.b_buf, *this.b, *this.a);

        if this.a_buf.transferred != a_before {
            this.counters
                .up
                .fetch_add(this.a_buf.transferred - a_before, Ordering::Relaxed);
        }
        if this.b_buf.transferred != b_before {
            this.counters
                .down
                .fetch_add(this.b_buf.transferred - b_before, Ordering::Relaxed);
        }

        if let Poll::Ready(res) = a_to_b {
            return Poll::Ready(res.map(|()| CopyOutcome::PeerClosed));
        }
        if let Poll::Ready(res) = b_to_a {
            return Poll::Ready(res.map(|()| CopyOutcome::PeerClosed));
        }

        let moved = this.a_buf.transferred != a_before || this.b_buf.transferred != b_before;
        if moved {
            let deadline = tokio::time::Instant::now() + *this.idle_timeout;
            this.idle_sleep.as_mut().reset(deadline);
        } else if this.idle_sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(CopyOutcome::IdleTimeout));
        }

        Poll::Pending
    }
}

/// Pump bytes both ways until one side closes, an error occurs, or the idle
/// timeout elapses. `a` is the client side for counter attribution.
pub async fn copy_bidirectional<A, B>(
    a: &mut A,
    b: &mut B,
    counters: Arc<TrafficCounters>,
    idle_timeout: Duration,
) -> io::Result<CopyOutcome>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let idle_sleep = tokio::time::sleep(idle_timeout);

    CopyBidirectional {
        a,
        b,
        a_buf: CopyBuffer::new(),
        b_buf: CopyBuffer::new(),
        a_to_b: TransferState::Running,
        b_to_a: TransferState::Running,
        counters,
        idle_timeout,
        idle_sleep,
    }
    .await
}
