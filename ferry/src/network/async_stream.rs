//! The uniform connection abstraction.
//!
//! Every transport the proxy touches (accepted TCP connections, dialed
//! upstreams, TLS-terminated client sides, cipher-wrapped tunnels, in-memory
//! test pipes) is used through `Box<dyn AsyncStream>`, so the forwarding
//! code never knows which one it has.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl AsyncStream for tokio::net::TcpStream {}

impl AsyncStream for tokio::io::DuplexStream {}

impl<T: AsyncStream> AsyncStream for tokio_rustls::client::TlsStream<T> {}

impl<T: AsyncStream> AsyncStream for tokio_rustls::server::TlsStream<T> {}

impl AsyncStream for Box<dyn AsyncStream> {}

// Upgraded CONNECT bodies come back from hyper in its own io traits; TokioIo
// adapts them to ours.
impl AsyncStream for hyper_util::rt::TokioIo<hyper::upgrade::Upgraded> {}

/// A stream with bytes that were over-read during a handshake pushed back
/// in front of it.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    offset: usize,
    inner: Box<dyn AsyncStream>,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: Box<dyn AsyncStream>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let n = buf.remaining().min(self.prefix.len() - self.offset);
            let offset = self.offset;
            buf.put_slice(&self.prefix[offset..offset + n]);
            self.offset += n;
            if self.offset == self.prefix.len() {
                self.prefix = Vec::new();
                self.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl AsyncStream for PrefixedStream {}
