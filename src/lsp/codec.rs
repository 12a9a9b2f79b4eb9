//! `Content-Length` framing for JSON-RPC over the language server pipes.
//!
//! Each message is `Content-Length: N\r\n\r\n` followed by exactly `N` bytes
//! of UTF-8 JSON. [`FrameReader`] hands back raw bodies so that a body which
//! fails to parse can be skipped by the caller without losing the stream.

use serde::Serialize;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

use crate::error::TransportError;

/// Maximum accepted body size (64 MiB).
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Reads framed message bodies from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Reads the next frame body.
    ///
    /// Returns `Ok(None)` on EOF between frames. Header problems and
    /// oversized frames are reported as recoverable errors after the
    /// offending bytes have been consumed.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(length) = self.read_headers().await? else {
            return Ok(None);
        };

        if length > MAX_FRAME_BYTES {
            let mut limited = (&mut self.reader).take(length as u64);
            tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            return Err(TransportError::FrameTooLarge {
                length,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    /// Consumes one header block, returning its `Content-Length`.
    async fn read_headers(&mut self) -> Result<Option<usize>, TransportError> {
        let mut content_length: Result<Option<usize>, String> = Ok(None);
        let mut saw_header = false;
        let mut raw = Vec::new();

        loop {
            raw.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut raw).await?;
            if bytes_read == 0 {
                if !saw_header {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF while reading headers",
                )
                .into());
            }

            // Header values are ASCII; anything else only needs to be skipped.
            let line = String::from_utf8_lossy(&raw);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                // Blank lines before any header are noise between frames.
                if saw_header {
                    break;
                }
                continue;
            }
            saw_header = true;

            let Some((key, value)) = trimmed.split_once(':') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("Content-Length") {
                content_length = value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| format!("invalid Content-Length value {:?}", value.trim()));
            }
        }

        match content_length {
            Ok(Some(length)) => Ok(Some(length)),
            Ok(None) => Err(TransportError::InvalidFormat(
                "missing Content-Length header".to_string(),
            )),
            Err(msg) => Err(TransportError::InvalidFormat(msg)),
        }
    }
}

/// Writes framed messages to an async writer.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serializes `message` and writes it with its `Content-Length` header.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let body = serde_json::to_vec(message)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
