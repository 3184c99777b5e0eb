//! Length-prefixed stream framing.
//!
//! Every message on a plugin's stdin/stdout is encoded as:
//! ```text
//! [LEN:8][BODY:LEN]
//! ```
//! LEN is an unsigned 64-bit integer in network byte order (big endian).
//!
//! A reader that hits EOF before the first header byte reports a clean end of
//! stream (`Ok(None)`). EOF anywhere inside a header or body is a truncation
//! error.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::FramingError;

/// Size of the length header in bytes
pub const LENGTH_SIZE: usize = 8;

/// Largest body a reader will accept (256 MiB).
/// Guards against allocating on a corrupted length header.
pub const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Default capacity of the channel returned by [`spawn_frame_stream`]
pub const DEFAULT_STREAM_CAPACITY: usize = 16;

fn check_len(len: u64) -> Result<(), FramingError> {
    if len > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

// ============================================================================
// Blocking variants (plugin side)
// ============================================================================

/// Write one frame and flush the writer.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError> {
    // Qualified: tokio's AsyncWriteExt offers a `write_u64` too
    WriteBytesExt::write_u64::<BigEndian>(writer, payload.len() as u64)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, FramingError> {
    let mut header = [0u8; LENGTH_SIZE];
    let filled = fill(reader, &mut header)?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < LENGTH_SIZE {
        return Err(FramingError::TruncatedHeader {
            expected: LENGTH_SIZE,
            got: filled,
        });
    }

    let len = ReadBytesExt::read_u64::<BigEndian>(&mut &header[..])?;
    check_len(len)?;

    let mut body = Vec::new();
    let got = reader.by_ref().take(len).read_to_end(&mut body)? as u64;
    if got < len {
        return Err(FramingError::TruncatedBody { expected: len, got });
    }
    Ok(Some(body))
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Lazy iterator over the frames of a blocking reader.
///
/// Iteration ends at EOF or at the first error; the error (if any) is kept
/// aside and can be collected with [`FrameIter::take_error`].
pub struct FrameIter<R> {
    reader: R,
    error: Option<FramingError>,
    finished: bool,
}

impl<R: Read> FrameIter<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            error: None,
            finished: false,
        }
    }

    /// Error that stopped the iteration, if it did not end at a clean EOF.
    pub fn take_error(&mut self) -> Option<FramingError> {
        self.error.take()
    }
}

impl<R: Read> Iterator for FrameIter<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match read_frame(&mut self.reader) {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                self.error = Some(e);
                None
            }
        }
    }
}

// ============================================================================
// Async variants (host side)
// ============================================================================

/// Write one frame and flush the writer.
pub async fn write_frame_async<W>(writer: &mut W, payload: &[u8]) -> Result<(), FramingError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF.
pub async fn read_frame_async<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FramingError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LENGTH_SIZE];
    let mut filled = 0;
    while filled < LENGTH_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < LENGTH_SIZE {
        return Err(FramingError::TruncatedHeader {
            expected: LENGTH_SIZE,
            got: filled,
        });
    }

    let len = u64::from_be_bytes(header);
    check_len(len)?;

    let mut body = Vec::new();
    let got = (&mut *reader).take(len).read_to_end(&mut body).await? as u64;
    if got < len {
        return Err(FramingError::TruncatedBody { expected: len, got });
    }
    Ok(Some(body))
}

/// Frames decoded by a background reader task.
///
/// `frames` closes at EOF or on error; `outcome` then reports how the stream ended.
pub struct FrameStream {
    pub frames: mpsc::Receiver<Vec<u8>>,
    pub outcome: oneshot::Receiver<Result<(), FramingError>>,
}

impl FrameStream {
    /// Wait for the reader task to finish and return its outcome.
    ///
    /// Only meaningful once `frames` has been drained.
    pub async fn finish(self) -> Result<(), FramingError> {
        self.outcome.await.unwrap_or(Ok(()))
    }
}

/// Spawn a task that decodes frames from `reader` until EOF.
///
/// If the receiving side is dropped the task stops reading.
pub fn spawn_frame_stream<R>(reader: R, capacity: usize) -> FrameStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (outcome_tx, outcome_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut reader = reader;
        let outcome = loop {
            match read_frame_async(&mut reader).await {
                Ok(Some(frame)) => {
                    if tx.send(frame).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        // Close the frame channel before reporting, so a consumer that drains
        // `frames` first never waits on the outcome.
        drop(tx);
        let _ = outcome_tx.send(outcome);
    });

    FrameStream {
        frames: rx,
        outcome: outcome_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn framed(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for payload in payloads {
            write_frame(&mut buf, payload).unwrap();
        }
        buf
    }

    #[test]
    fn test_header_is_big_endian_u64() {
        let buf = framed(&[b"abc"]);
        assert_eq!(&buf[..LENGTH_SIZE], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&buf[LENGTH_SIZE..], b"abc");
    }

    #[test]
    fn test_roundtrip_including_empty_and_binary() {
        let binary: Vec<u8> = (0..=255u8).collect();
        let buf = framed(&[b"", &binary, b"hello"]);
        let mut cursor = Cursor::new(buf);

        assert_eq!(read_frame(&mut cursor).unwrap(), Some(Vec::new()));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(binary));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(b"hello".to_vec()));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn test_eof_before_header_is_not_an_error() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0]);
        let result = read_frame(&mut cursor);
        assert!(matches!(
            result,
            Err(FramingError::TruncatedHeader { expected: 8, got: 3 })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let mut buf = framed(&[b"0123456789"]);
        buf.truncate(LENGTH_SIZE + 4);
        let mut cursor = Cursor::new(buf);
        let result = read_frame(&mut cursor);
        assert!(matches!(
            result,
            Err(FramingError::TruncatedBody { expected: 10, got: 4 })
        ));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor),
            Err(FramingError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_iter_reports_truncation_on_side_channel() {
        let mut buf = framed(&[b"one", b"two"]);
        buf.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 9, b'x']);

        let mut iter = FrameIter::new(Cursor::new(buf));
        let frames: Vec<Vec<u8>> = iter.by_ref().collect();
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(matches!(
            iter.take_error(),
            Some(FramingError::TruncatedBody { expected: 9, got: 1 })
        ));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_frame_iter_clean_eof() {
        let mut iter = FrameIter::new(Cursor::new(framed(&[b"only"])));
        assert_eq!(iter.next(), Some(b"only".to_vec()));
        assert_eq!(iter.next(), None);
        assert!(iter.take_error().is_none());
    }

    #[tokio::test]
    async fn test_async_reads_blocking_writer_output() {
        let buf = framed(&[b"first", b"", b"third"]);
        let mut reader = &buf[..];

        assert_eq!(read_frame_async(&mut reader).await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(read_frame_async(&mut reader).await.unwrap(), Some(Vec::new()));
        assert_eq!(read_frame_async(&mut reader).await.unwrap(), Some(b"third".to_vec()));
        assert_eq!(read_frame_async(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_blocking_reads_async_writer_output() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame_async(&mut buf, b"from async").await.unwrap();
        write_frame_async(&mut buf, &[0xff, 0x00, 0x7f]).await.unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(b"from async".to_vec()));
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(vec![0xff, 0x00, 0x7f]));
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[tokio::test]
    async fn test_async_truncated_header() {
        let buf = [0u8; 5];
        let mut reader = &buf[..];
        assert!(matches!(
            read_frame_async(&mut reader).await,
            Err(FramingError::TruncatedHeader { expected: 8, got: 5 })
        ));
    }

    #[tokio::test]
    async fn test_frame_stream_ends_at_eof() {
        let buf = framed(&[b"a", b"b", b"c"]);
        let mut stream = spawn_frame_stream(Cursor::new(buf), 1);

        let mut got = Vec::new();
        while let Some(frame) = stream.frames.recv().await {
            got.push(frame);
        }
        assert_eq!(got, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(stream.finish().await.is_ok());
    }

    #[tokio::test]
    async fn test_frame_stream_reports_truncation() {
        let mut buf = framed(&[b"ok"]);
        buf.extend_from_slice(&[0, 0, 0]);
        let mut stream = spawn_frame_stream(Cursor::new(buf), 4);

        assert_eq!(stream.frames.recv().await, Some(b"ok".to_vec()));
        assert_eq!(stream.frames.recv().await, None);
        assert!(matches!(
            stream.finish().await,
            Err(FramingError::TruncatedHeader { .. })
        ));
    }
}
