//! Delimiter-framed transport over a byte stream.
//!
//! A frame is everything up to the next `\n`. Reads happen in fixed-size
//! chunks and may end anywhere: mid-frame, exactly on a delimiter, or past
//! it with the start of the next frame. Bytes after a delimiter stay
//! buffered for the next call. Writes always emit the payload followed by
//! the delimiter, however many partial writes that takes.

use crate::protocol::MESSAGE_DELIMITER;
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of each read from the socket
pub const READ_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Peer closed between frames
    #[error("connection closed by peer")]
    ConnectionClosed,
    /// Peer closed in the middle of a frame
    #[error("truncated frame: connection closed with {pending} bytes pending")]
    Truncated { pending: usize },
    #[error("frame exceeds {limit} bytes without a delimiter")]
    TooLarge { limit: usize },
}

/// Reads delimiter-terminated frames from a stream.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no delimiter
    scanned: usize,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_size: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            scanned: 0,
            max_frame_size,
        }
    }

    /// Receive the next frame, delimiter stripped and trailing whitespace trimmed.
    pub async fn receive_frame(&mut self) -> Result<Bytes, FrameError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            if let Some(pos) = self.buffer[self.scanned..]
                .iter()
                .position(|&b| b == MESSAGE_DELIMITER)
            {
                let end = self.scanned + pos;
                let mut frame = self.buffer.split_to(end + 1);
                self.scanned = 0;

                frame.truncate(end);
                while frame.last().is_some_and(u8::is_ascii_whitespace) {
                    frame.truncate(frame.len() - 1);
                }
                return Ok(frame.freeze());
            }
            self.scanned = self.buffer.len();

            if self.buffer.len() > self.max_frame_size {
                return Err(FrameError::TooLarge {
                    limit: self.max_frame_size,
                });
            }

            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(if self.buffer.is_empty() {
                    FrameError::ConnectionClosed
                } else {
                    FrameError::Truncated {
                        pending: self.buffer.len(),
                    }
                });
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Send `payload` followed by the frame delimiter.
pub async fn send_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let mut frame = BytesMut::with_capacity(payload.len() + 1);
    frame.put_slice(payload);
    frame.put_u8(MESSAGE_DELIMITER);

    // write_all retries short writes until the whole frame is out
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
