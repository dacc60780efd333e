//! ---
//! gw_section: "04-networking-transport"
//! gw_subsection: "module"
//! gw_type: "source"
//! gw_scope: "code"
//! gw_description: "NUL-delimited frame splitting for the server streams."
//! gw_version: "v0.0.0-prealpha"
//! gw_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::{LinkError, Result};

/// Byte terminating every envelope on the wire.
pub const FRAME_DELIMITER: u8 = 0;

/// Largest unfinished frame a splitter holds before giving up on the stream.
pub const MAX_FRAME_LEN: usize = 1 << 20;

const READ_CHUNK: usize = 4096;

/// Accumulates stream bytes and yields complete frames; partial data is
/// carried over to the next push.
#[derive(Debug)]
pub struct FrameSplitter {
    residue: Vec<u8>,
    limit: usize,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_LEN)
    }
}

impl FrameSplitter {
    /// Empty splitter bounded by [`MAX_FRAME_LEN`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty splitter that rejects unfinished frames longer than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            residue: Vec::new(),
            limit,
        }
    }

    /// Append stream bytes.
    ///
    /// Fails with [`LinkError::FrameTooLarge`] and drops the buffered bytes
    /// when the unfinished frame outgrows the limit.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        self.residue.extend_from_slice(bytes);
        let unfinished = match self.residue.iter().rposition(|b| *b == FRAME_DELIMITER) {
            Some(pos) => self.residue.len() - pos - 1,
            None => self.residue.len(),
        };
        if unfinished > self.limit {
            self.residue.clear();
            return Err(LinkError::FrameTooLarge { limit: self.limit });
        }
        Ok(())
    }

    /// Take the next complete frame, skipping empty ones.
    pub fn next_frame(&mut self) -> Option<String> {
        while let Some(pos) = self.residue.iter().position(|b| *b == FRAME_DELIMITER) {
            let rest = self.residue.split_off(pos + 1);
            let mut frame = std::mem::replace(&mut self.residue, rest);
            frame.pop();
            if !frame.is_empty() {
                return Some(String::from_utf8_lossy(&frame).into_owned());
            }
        }
        None
    }

    /// Append `bytes` and return every frame completed so far.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        self.extend(bytes)?;
        Ok(std::iter::from_fn(|| self.next_frame()).collect())
    }

    /// Bytes of the unfinished frame.
    pub fn pending(&self) -> usize {
        self.residue.len()
    }
}

/// Read from `reader` until `splitter` holds a complete frame, with `budget`
/// per read. Bytes past that frame stay in `splitter`.
pub async fn read_frame<R>(
    reader: &mut R,
    splitter: &mut FrameSplitter,
    budget: Duration,
) -> Result<String>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if let Some(frame) = splitter.next_frame() {
            return Ok(frame);
        }
        let n = timeout(budget, reader.read(&mut buf))
            .await
            .map_err(|_| LinkError::Timeout { operation: "read response" })??;
        if n == 0 {
            return Err(LinkError::Disconnected);
        }
        splitter.extend(&buf[..n])?;
    }
}

/// Write `envelope` followed by the delimiter, bounded by `budget`.
pub async fn write_frame<W>(writer: &mut W, envelope: &str, budget: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = Vec::with_capacity(envelope.len() + 1);
    frame.extend_from_slice(envelope.as_bytes());
    frame.push(FRAME_DELIMITER);
    timeout(budget, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| LinkError::Timeout { operation: "write request" })??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_keeps_residue() {
        let mut splitter = FrameSplitter::new();
        assert!(splitter.push(b"<a/").unwrap().is_empty());
        assert_eq!(splitter.pending(), 3);
        assert_eq!(splitter.push(b">\0\0<b/>\0<c").unwrap(), vec!["<a/>", "<b/>"]);
        assert_eq!(splitter.pending(), 2);
        assert_eq!(splitter.push(b"/>\0").unwrap(), vec!["<c/>"]);
        assert_eq!(splitter.pending(), 0);
    }

    #[test]
    fn unterminated_frame_is_bounded() {
        let mut splitter = FrameSplitter::with_limit(8);
        assert_eq!(splitter.push(b"<long/>\0<more").unwrap(), vec!["<long/>"]);
        let err = splitter.push(b"-and-more").unwrap_err();
        assert!(matches!(err, LinkError::FrameTooLarge { limit: 8 }));
        assert_eq!(splitter.pending(), 0);
        assert_eq!(splitter.push(b"<ok/>\0").unwrap(), vec!["<ok/>"]);
    }

    #[tokio::test]
    async fn reads_one_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"<x/>\0<y").await.unwrap();
        });
        let mut splitter = FrameSplitter::new();
        let frame = read_frame(&mut client, &mut splitter, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(frame, "<x/>");
        assert_eq!(splitter.pending(), 2);
    }

    #[tokio::test]
    async fn closed_stream_is_disconnect() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        let err = read_frame(&mut client, &mut FrameSplitter::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Disconnected));
    }

    #[tokio::test]
    async fn endless_frame_fails_the_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let _ = server.write_all(&[b'x'; 64]).await;
            let _ = server.write_all(&[b'x'; 64]).await;
        });
        let err = read_frame(&mut client, &mut FrameSplitter::with_limit(32), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::FrameTooLarge { limit: 32 }));
    }
}
