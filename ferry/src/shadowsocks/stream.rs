//! The cipher-wrapped connection.
//!
//! Plaintext in, ciphertext out. Each direction lazily establishes its own
//! IV (stream family) or salt plus HKDF subkey (AEAD family) the first time
//! it moves bytes, so a wrapped connection can be handed around before any
//! handshake traffic exists.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::network::async_stream::AsyncStream;
use crate::utils::allocate_vec;

use super::cipher::{
    AEAD_MAX_PAYLOAD, AEAD_TAG_LEN, AeadState, CipherKind, StreamDecryptor, StreamEncryptor,
};
use super::key::derive_subkey;

enum SealState {
    Pending,
    Stream(StreamEncryptor),
    Aead(AeadState),
}

enum OpenState {
    Pending,
    Stream(StreamDecryptor),
    Aead {
        state: AeadState,
        // Payload length already authenticated from the length chunk, when
        // the payload itself has not fully arrived yet.
        expected_payload: Option<usize>,
    },
}

pub struct ShadowsocksStream {
    inner: Box<dyn AsyncStream>,
    kind: CipherKind,
    key: Vec<u8>,

    seal: SealState,
    open: OpenState,

    // Raw ciphertext read from the transport, not yet decrypted.
    ciphertext: BytesMut,
    // Plaintext decrypted but not yet delivered to the caller.
    plaintext: BytesMut,
    // Ciphertext produced but not yet accepted by the transport.
    write_pending: BytesMut,

    read_eof: bool,
}

impl ShadowsocksStream {
    pub fn new(inner: Box<dyn AsyncStream>, kind: CipherKind, key: Vec<u8>) -> Self {
        Self {
            inner,
            kind,
            key,
            seal: SealState::Pending,
            open: OpenState::Pending,
            ciphertext: BytesMut::with_capacity(16 * 1024),
            plaintext: BytesMut::new(),
            write_pending: BytesMut::new(),
            read_eof: false,
        }
    }

    /// Generate the direction prefix and switch the seal state to live.
    fn init_seal(&mut self) -> io::Result<()> {
        let mut prefix = allocate_vec(self.kind.prefix_len());
        rand::rng().fill_bytes(&mut prefix);

        self.seal = if self.kind.is_aead() {
            let subkey = derive_subkey(&self.key, &prefix, self.kind.key_len());
            SealState::Aead(AeadState::new(self.kind, &subkey)?)
        } else {
            SealState::Stream(StreamEncryptor::new(self.kind, &self.key, &prefix)?)
        };
        self.write_pending.put_slice(&prefix);
        Ok(())
    }

    fn encrypt_into_pending(&mut self, buf: &[u8]) -> io::Result<()> {
        if matches!(self.seal, SealState::Pending) {
            self.init_seal()?;
        }
        match &mut self.seal {
            SealState::Stream(enc) => {
                let mut data = buf.to_vec();
                enc.apply(&mut data);
                self.write_pending.put_slice(&data);
            }
            SealState::Aead(state) => {
                for chunk in buf.chunks(AEAD_MAX_PAYLOAD) {
                    let mut out = Vec::with_capacity(2 + AEAD_TAG_LEN + chunk.len() + AEAD_TAG_LEN);
                    let len_bytes = ((chunk.len() & AEAD_MAX_PAYLOAD) as u16).to_be_bytes();
                    state.seal(&len_bytes, &mut out)?;
                    state.seal(chunk, &mut out)?;
                    self.write_pending.put_slice(&out);
                }
            }
            SealState::Pending => unreachable!("seal state initialized above"),
        }
        Ok(())
    }

    /// Push buffered ciphertext into the transport. Ready(()) means drained.
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_pending.is_empty() {
            let n = match Pin::new(&mut self.inner).poll_write(cx, &self.write_pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "transport closed with pending ciphertext",
                    )));
                }
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            self.write_pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    /// Decrypt whatever complete units sit in `ciphertext`.
    fn drain_ciphertext(&mut self) -> io::Result<()> {
        if matches!(self.open, OpenState::Pending) {
            let prefix_len = self.kind.prefix_len();
            if self.ciphertext.len() < prefix_len {
                return Ok(());
            }
            let prefix = self.ciphertext.split_to(prefix_len);
            self.open = if self.kind.is_aead() {
                let subkey = derive_subkey(&self.key, &prefix, self.kind.key_len());
                OpenState::Aead {
                    state: AeadState::new(self.kind, &subkey)?,
                    expected_payload: None,
                }
            } else {
                OpenState::Stream(StreamDecryptor::new(self.kind, &self.key, &prefix)?)
            };
        }

        match &mut self.open {
            OpenState::Stream(dec) => {
                if !self.ciphertext.is_empty() {
                    let mut data = self.ciphertext.split().to_vec();
                    dec.apply(&mut data);
                    self.plaintext.put_slice(&data);
                }
            }
            OpenState::Aead {
                state,
                expected_payload,
            } => loop {
                match expected_payload {
                    None => {
                        if self.ciphertext.len() < 2 + AEAD_TAG_LEN {
                            break;
                        }
                        let chunk = self.ciphertext.split_to(2 + AEAD_TAG_LEN);
                        let len_bytes = state.open(&chunk)?;
                        if len_bytes.len() != 2 {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "bad aead length chunk",
                            ));
                        }
                        let len =
                            (u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize) & AEAD_MAX_PAYLOAD;
                        *expected_payload = Some(len);
                    }
                    Some(len) => {
                        let need = *len + AEAD_TAG_LEN;
                        if self.ciphertext.len() < need {
                            break;
                        }
                        let chunk = self.ciphertext.split_to(need);
                        let payload = state.open(&chunk)?;
                        self.plaintext.put_slice(&payload);
                        *expected_payload = None;
                    }
                }
            },
            OpenState::Pending => {}
        }
        Ok(())
    }

    fn deliver(&mut self, buf: &mut ReadBuf<'_>) {
        let n = buf.remaining().min(self.plaintext.len());
        buf.put_slice(&self.plaintext.split_to(n));
    }

    /// Whether ciphertext remains that can never form a complete unit.
    fn has_truncated_tail(&self) -> bool {
        match &self.open {
            OpenState::Pending => !self.ciphertext.is_empty(),
            OpenState::Stream(_) => false,
            OpenState::Aead {
                expected_payload, ..
            } => !self.ciphertext.is_empty() || expected_payload.is_some(),
        }
    }
}

impl AsyncRead for ShadowsocksStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.plaintext.is_empty() {
                this.deliver(buf);
                return Poll::Ready(Ok(()));
            }

            if this.read_eof {
                if this.has_truncated_tail() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        crate::error::CipherStreamError::TruncatedFrame,
                    )));
                }
                return Poll::Ready(Ok(()));
            }

            let mut scratch = [0u8; 16 * 1024];
            let mut read_buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.read_eof = true;
                    } else {
                        this.ciphertext.put_slice(filled);
                        this.drain_ciphertext()?;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for ShadowsocksStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // Finish the previous write's ciphertext before accepting more
        // plaintext; this bounds the pending buffer to one write's worth.
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.encrypt_into_pending(buf)?;

        // Opportunistically push what we can; leftovers flush later.
        match this.poll_drain_pending(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            _ => {}
        }

        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

impl AsyncStream for ShadowsocksStream {}
