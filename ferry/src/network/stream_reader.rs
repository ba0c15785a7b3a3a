//! A pull-based buffered reader for parsing protocol prefixes.
//!
//! Handshake parsing (SOCKS5, shadowsocks address headers) reads small
//! framed fields but must not lose any read-ahead bytes: whatever the peer
//! pipelined after its handshake belongs to the tunnel. The reader keeps the
//! surplus and hands it back through `unparsed_data`.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::utils::allocate_vec;

pub struct StreamReader {
    buf: Vec<u8>,
    start: usize,
    end: usize,
}

impl StreamReader {
    pub fn new() -> Self {
        Self::with_buffer_size(4096)
    }

    pub fn with_buffer_size(size: usize) -> Self {
        Self {
            buf: allocate_vec(size),
            start: 0,
            end: 0,
        }
    }

    fn buffered(&self) -> usize {
        self.end - self.start
    }

    async fn fill<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut R,
        needed: usize,
    ) -> std::io::Result<()> {
        if self.buffered() >= needed {
            return Ok(());
        }
        // Compact or grow so the request fits contiguously.
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        if needed > self.buf.len() {
            self.buf.resize(needed.next_power_of_two(), 0);
        }
        while self.buffered() < needed {
            let n = stream.read(&mut self.buf[self.end..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "eof while reading protocol header",
                ));
            }
            self.end += n;
        }
        Ok(())
    }

    pub async fn read_u8<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut R,
    ) -> std::io::Result<u8> {
        self.fill(stream, 1).await?;
        let b = self.buf[self.start];
        self.start += 1;
        Ok(b)
    }

    pub async fn read_u16_be<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut R,
    ) -> std::io::Result<u16> {
        self.fill(stream, 2).await?;
        let v = u16::from_be_bytes([self.buf[self.start], self.buf[self.start + 1]]);
        self.start += 2;
        Ok(v)
    }

    pub async fn read_slice<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        stream: &mut R,
        len: usize,
    ) -> std::io::Result<&[u8]> {
        self.fill(stream, len).await?;
        let slice = &self.buf[self.start..self.start + len];
        self.start += len;
        Ok(slice)
    }

    /// Bytes read from the peer but not consumed by the parser.
    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn unparsed_data_owned(&self) -> Option<Vec<u8>> {
        if self.start == self.end {
            None
        } else {
            Some(self.buf[self.start..self.end].to_vec())
        }
    }
}

impl Default for StreamReader {
    fn default() -> Self {
        Self::new()
    }
}
