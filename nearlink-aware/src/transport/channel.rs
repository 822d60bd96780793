//! Bidirectional byte stream between two network-connected peers.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::error::{AwareError, AwareResult};
use crate::peer::PeerHandle;
use crate::transport::PayloadPattern;

/// Read buffer size for draining the stream.
const READ_CHUNK: usize = 16 * 1024;

/// Longest request line accepted, terminator excluded.
pub const MAX_LINE_LEN: usize = 1024;

/// A connected socket owned by one session worker.
///
/// The socket is released exactly once: by [`close`](Self::close), by
/// [`finish`](Self::finish) or on drop, whichever comes first.
#[derive(Debug)]
pub struct TransportChannel {
    peer: PeerHandle,
    remote: SocketAddr,
    stream: Option<BufReader<TcpStream>>,
}

impl TransportChannel {
    /// Wrap a connected stream.
    pub fn new(peer: PeerHandle, stream: TcpStream) -> AwareResult<Self> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer = %peer, addr = %remote, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Self {
            peer,
            remote,
            stream: Some(BufReader::new(stream)),
        })
    }

    /// Address of the other end.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn stream(&mut self) -> AwareResult<&mut BufReader<TcpStream>> {
        self.stream.as_mut().ok_or(AwareError::ChannelClosed)
    }

    /// Read one newline-terminated line, without the terminator.
    ///
    /// End of stream before the newline is an error, as is a line longer
    /// than [`MAX_LINE_LEN`] bytes.
    pub async fn read_line(&mut self) -> AwareResult<String> {
        let stream = self.stream()?;
        let mut buf = Vec::new();
        let mut limited = (&mut *stream).take(MAX_LINE_LEN as u64 + 1);
        limited.read_until(b'\n', &mut buf).await?;

        if buf.last() != Some(&b'\n') {
            let err = if buf.len() > MAX_LINE_LEN {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {} bytes", MAX_LINE_LEN),
                )
            } else {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed before completing a line",
                )
            };
            return Err(err.into());
        }

        let mut line =
            String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        Ok(line)
    }

    /// Write one line followed by a newline.
    pub async fn write_line(&mut self, line: &str) -> AwareResult<()> {
        let stream = self.stream()?.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        Ok(())
    }

    /// Write the whole buffer.
    pub async fn write_all(&mut self, buf: &[u8]) -> AwareResult<()> {
        self.stream()?.get_mut().write_all(buf).await?;
        Ok(())
    }

    /// Write the bulk payload. Returns the bytes written.
    pub async fn write_payload(&mut self, pattern: &PayloadPattern) -> AwareResult<u64> {
        let written = pattern.write_to(self.stream()?.get_mut()).await?;
        Ok(written)
    }

    /// Read until the peer closes, handing each chunk to `on_chunk`.
    ///
    /// Returns the number of bytes read.
    pub async fn read_to_end_with<F>(&mut self, mut on_chunk: F) -> AwareResult<u64>
    where
        F: FnMut(&[u8]),
    {
        let stream = self.stream()?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut total = 0u64;
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            on_chunk(&buf[..n]);
            total += n as u64;
        }
        Ok(total)
    }

    /// Flush, send end-of-stream and release the socket.
    pub async fn finish(&mut self) -> AwareResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let result = stream.get_mut().shutdown().await;
            tracing::debug!(peer = %self.peer, addr = %self.remote, "Transport channel finished");
            result?;
        }
        Ok(())
    }

    /// Release the socket. Returns false if it was already released.
    pub fn close(&mut self) -> bool {
        match self.stream.take() {
            Some(_) => {
                tracing::debug!(peer = %self.peer, addr = %self.remote, "Transport channel closed");
                true
            }
            None => false,
        }
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        self.close();
    }
}
