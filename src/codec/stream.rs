//! Per-stream codec state machine. One `HttpStream` wraps one socket and is
//! reused across requests on a keep-alive connection; body framing state
//! lives here so a half-read body can never be confused with the next head.

use super::chunked::{self, ChunkEvent, ChunkedDecoder};
use super::head::{self, RequestHead, ResponseHead};
use super::{BodyKind, CodecError};
use crate::net::{BufferPool, PooledBuf};
use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default cap on the header section of a single message.
pub const DEFAULT_MAX_HEAD_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug)]
enum BodyState {
    None,
    Length { remaining: u64 },
    Chunked(ChunkedDecoder),
    UntilClose,
}

pub struct HttpStream<S> {
    io: S,
    rbuf: PooledBuf,
    body: BodyState,
    max_head_bytes: usize,
    bytes_read: u64,
    bytes_written: u64,
}

impl<S> HttpStream<S> {
    pub fn new(io: S, buffers: &Arc<BufferPool>) -> Self {
        Self {
            io,
            rbuf: buffers.acquire(READ_CHUNK),
            body: BodyState::None,
            max_head_bytes: DEFAULT_MAX_HEAD_BYTES,
            bytes_read: 0,
            bytes_written: 0,
        }
    }

    pub fn with_max_head_bytes(mut self, max: usize) -> Self {
        self.max_head_bytes = max;
        self
    }

    pub fn io_ref(&self) -> &S {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut S {
        &mut self.io
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether unconsumed input is already buffered. A pooled idle
    /// connection with buffered input is dirty and must be discarded.
    pub fn has_buffered_input(&self) -> bool {
        !self.rbuf.is_empty()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpStream<S> {
    /// Read the next request head. `Ok(None)` means the peer closed the
    /// connection cleanly between requests.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, CodecError> {
        debug_assert!(matches!(self.body, BodyState::None));
        loop {
            if let Some((parsed, consumed)) =
                head::parse_request_head(&self.rbuf, self.max_head_bytes)?
            {
                self.rbuf.advance(consumed);
                return Ok(Some(parsed));
            }
            if self.fill().await? == 0 {
                if self.rbuf.is_empty() {
                    return Ok(None);
                }
                return Err(CodecError::UnexpectedEof);
            }
        }
    }

    /// Read the next response head.
    pub async fn read_response_head(&mut self) -> Result<ResponseHead, CodecError> {
        debug_assert!(matches!(self.body, BodyState::None));
        loop {
            if let Some((parsed, consumed)) =
                head::parse_response_head(&self.rbuf, self.max_head_bytes)?
            {
                self.rbuf.advance(consumed);
                return Ok(parsed);
            }
            if self.fill().await? == 0 {
                return Err(CodecError::UnexpectedEof);
            }
        }
    }

    /// Arm body reading for the message whose head was just read.
    pub fn begin_body(&mut self, kind: BodyKind) {
        self.body = match kind {
            BodyKind::Empty => BodyState::None,
            BodyKind::Length(n) => BodyState::Length { remaining: n },
            BodyKind::Chunked => BodyState::Chunked(ChunkedDecoder::new()),
            BodyKind::UntilClose => BodyState::UntilClose,
        };
    }

    /// Next frame of the current body; `None` when the body is complete.
    /// Frames are produced lazily and cannot be replayed.
    pub async fn next_body_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        let remaining = match &self.body {
            BodyState::None => return Ok(None),
            BodyState::Length { remaining } => Some(*remaining),
            BodyState::Chunked(_) => return self.next_chunked_frame().await,
            BodyState::UntilClose => None,
        };

        match remaining {
            Some(remaining) => {
                if remaining == 0 {
                    self.body = BodyState::None;
                    return Ok(None);
                }
                if self.rbuf.is_empty() && self.fill().await? == 0 {
                    return Err(CodecError::UnexpectedEof);
                }
                let take = remaining.min(self.rbuf.len() as u64) as usize;
                let frame = Bytes::copy_from_slice(&self.rbuf[..take]);
                self.rbuf.advance(take);
                let left = remaining - take as u64;
                self.body = if left == 0 {
                    BodyState::None
                } else {
                    BodyState::Length { remaining: left }
                };
                Ok(Some(frame))
            }
            None => {
                // Until-close: the body ends when the peer does.
                if self.rbuf.is_empty() && self.fill().await? == 0 {
                    self.body = BodyState::None;
                    return Ok(None);
                }
                let len = self.rbuf.len();
                let frame = Bytes::copy_from_slice(&self.rbuf[..len]);
                self.rbuf.advance(len);
                Ok(Some(frame))
            }
        }
    }

    async fn next_chunked_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        loop {
            let event = match &mut self.body {
                BodyState::Chunked(decoder) => decoder.decode(&mut self.rbuf)?,
                _ => return Ok(None),
            };
            match event {
                ChunkEvent::Data(frame) => return Ok(Some(frame)),
                ChunkEvent::Done => {
                    self.body = BodyState::None;
                    return Ok(None);
                }
                ChunkEvent::NeedMore => {
                    if self.fill().await? == 0 {
                        return Err(CodecError::UnexpectedEof);
                    }
                }
            }
        }
    }

    /// Read and discard the rest of the current body. Returns the number of
    /// bytes skipped.
    pub async fn drain_body(&mut self) -> Result<u64, CodecError> {
        let mut skipped = 0u64;
        while let Some(frame) = self.next_body_frame().await? {
            skipped += frame.len() as u64;
        }
        Ok(skipped)
    }

    /// Read the entire current body into one buffer, failing once it
    /// exceeds `limit` bytes.
    pub async fn read_body_to_end(&mut self, limit: usize) -> Result<Bytes, CodecError> {
        let mut out = BytesMut::new();
        while let Some(frame) = self.next_body_frame().await? {
            if out.len() + frame.len() > limit {
                return Err(CodecError::Parse("body exceeds limit".into()));
            }
            out.extend_from_slice(&frame);
        }
        Ok(out.freeze())
    }

    pub async fn write_request_head(&mut self, head: &RequestHead) -> Result<(), CodecError> {
        let mut out = BytesMut::with_capacity(256);
        head::encode_request_head(head, &mut out);
        self.write_all(&out).await
    }

    pub async fn write_response_head(&mut self, head: &ResponseHead) -> Result<(), CodecError> {
        let mut out = BytesMut::with_capacity(256);
        head::encode_response_head(head, &mut out);
        self.write_all(&out).await
    }

    /// Write one body frame, chunk-framed when `chunked` is set.
    pub async fn write_body_frame(&mut self, data: &[u8], chunked: bool) -> Result<(), CodecError> {
        if data.is_empty() {
            return Ok(());
        }
        if chunked {
            let mut out = BytesMut::with_capacity(data.len() + 16);
            chunked::encode_chunk(data, &mut out);
            self.write_all(&out).await
        } else {
            self.write_all(data).await
        }
    }

    /// Terminate a chunk-framed body.
    pub async fn finish_body(&mut self, chunked: bool) -> Result<(), CodecError> {
        if chunked {
            let mut out = BytesMut::new();
            chunked::encode_final(&mut out);
            self.write_all(&out).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), CodecError> {
        self.io.flush().await?;
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), CodecError> {
        self.io.write_all(data).await?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, CodecError> {
        self.rbuf.reserve(READ_CHUNK);
        let n = self.io.read_buf(&mut *self.rbuf).await?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, StatusCode};

    fn pool() -> Arc<BufferPool> {
        BufferPool::new()
    }

    #[tokio::test]
    async fn test_read_request_with_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = HttpStream::new(server, &pool());

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(raw).await.unwrap();
        });

        let head = stream.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        let kind = head.body_kind().unwrap();
        stream.begin_body(kind);
        let body = stream.read_body_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"hello");
    }

    #[tokio::test]
    async fn test_keep_alive_two_requests() {
        let raw = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = HttpStream::new(server, &pool());

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(raw).await.unwrap();
        });

        let first = stream.read_request_head().await.unwrap().unwrap();
        assert_eq!(first.target, "/a");
        let second = stream.read_request_head().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        // Peer closed cleanly between messages.
        assert!(stream.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunked_body_frames() {
        let raw =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n";
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = HttpStream::new(server, &pool());

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(raw).await.unwrap();
        });

        let head = stream.read_request_head().await.unwrap().unwrap();
        stream.begin_body(head.body_kind().unwrap());
        let body = stream.read_body_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_write_response_round_trip() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut stream = HttpStream::new(server, &pool());

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert("content-length", "2".parse().unwrap());
        stream.write_response_head(&head).await.unwrap();
        stream.write_body_frame(b"hi", false).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn test_chunked_write_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = HttpStream::new(server, &pool());
        let mut reader = HttpStream::new(client, &pool());

        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert("transfer-encoding", "chunked".parse().unwrap());

        tokio::spawn(async move {
            writer.write_response_head(&head).await.unwrap();
            writer.write_body_frame(b"hello ", true).await.unwrap();
            writer.write_body_frame(b"world", true).await.unwrap();
            writer.finish_body(true).await.unwrap();
            writer.flush().await.unwrap();
        });

        let head = reader.read_response_head().await.unwrap();
        let kind = head.body_kind(false).unwrap();
        assert_eq!(kind, BodyKind::Chunked);
        reader.begin_body(kind);
        let body = reader.read_body_to_end(1024).await.unwrap();
        assert_eq!(&body[..], b"hello world");
    }

    #[tokio::test]
    async fn test_truncated_body_is_unexpected_eof() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        let (client, server) = tokio::io::duplex(1024);
        let mut stream = HttpStream::new(server, &pool());

        tokio::spawn(async move {
            let mut client = client;
            client.write_all(raw).await.unwrap();
        });

        let head = stream.read_request_head().await.unwrap().unwrap();
        stream.begin_body(head.body_kind().unwrap());
        match stream.read_body_to_end(1024).await {
            Err(CodecError::UnexpectedEof) => {}
            other => panic!("expected UnexpectedEof, got {:?}", other),
        }
    }
}
