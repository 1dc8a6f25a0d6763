//! Stream framing codecs.
//!
//! Two framings are in play: newline-delimited JSON for MCP stdio transports
//! (one complete object per line), and 4-byte big-endian length-prefixed
//! JSON for the sandbox bridge, where payloads may contain user data with
//! embedded newlines.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on a single frame. Anything larger is treated as a protocol
/// violation rather than buffered indefinitely.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Write one newline-delimited JSON frame and flush.
pub async fn write_line<W>(writer: &mut W, payload: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Reader for newline-delimited JSON frames. Partial lines are buffered
/// internally; empty lines are skipped.
pub struct LineReader<R> {
    lines: tokio::io::Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next non-empty line, or `None` on EOF.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<String>> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line)),
                None => return Ok(None),
            }
        }
    }
}

/// Write one length-prefixed frame (4-byte big-endian length, then payload).
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", payload.len()),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed frame. Returns `None` on clean EOF at a frame
/// boundary; EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn line_reader_skips_blank_lines() {
        let input: &[u8] = b"{\"a\":1}\n\n  \n{\"b\":2}\n";
        let mut reader = LineReader::new(input);
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), "{\"b\":2}");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn line_round_trip() {
        let mut buf = Vec::new();
        write_line(&mut buf, "{\"x\":true}").await.unwrap();
        let mut reader = LineReader::new(buf.as_slice());
        assert_eq!(reader.next_frame().await.unwrap().unwrap(), "{\"x\":true}");
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload with\nnewline").await.unwrap();
        write_frame(&mut buf, b"second").await.unwrap();

        let mut cursor = buf.as_slice();
        assert_eq!(
            read_frame(&mut cursor).await.unwrap().unwrap(),
            b"payload with\nnewline"
        );
        assert_eq!(read_frame(&mut cursor).await.unwrap().unwrap(), b"second");
        assert!(read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete").await.unwrap();
        buf.truncate(buf.len() - 3);

        let mut cursor = buf.as_slice();
        assert!(read_frame(&mut cursor).await.is_err());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = buf.as_slice();
        assert!(read_frame(&mut cursor).await.is_err());
    }
}
