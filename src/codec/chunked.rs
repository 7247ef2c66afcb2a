//! Incremental chunked transfer-coding decoder and encoder helpers.

use super::CodecError;
use bytes::{Buf, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};

/// Longest accepted chunk-size line (hex size plus extensions).
const MAX_SIZE_LINE: usize = 256;

#[derive(Debug)]
enum State {
    Size,
    Data { remaining: u64 },
    DataCrlf,
    Trailer,
    Done,
}

/// Events produced while feeding buffered input through the decoder.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent {
    Data(Bytes),
    NeedMore,
    Done,
}

#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    trailers: HeaderMap,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self {
            state: State::Size,
            trailers: HeaderMap::new(),
        }
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trailer headers collected after the terminal chunk.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Consume as much of `buf` as possible, producing at most one event.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<ChunkEvent, CodecError> {
        loop {
            match &mut self.state {
                State::Size => {
                    let Some(line_end) = find_crlf(buf) else {
                        if buf.len() > MAX_SIZE_LINE {
                            return Err(CodecError::Parse("chunk size line too long".into()));
                        }
                        return Ok(ChunkEvent::NeedMore);
                    };
                    let line = buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    // Chunk extensions after ';' are ignored.
                    let size_part = match line.iter().position(|&b| b == b';') {
                        Some(p) => &line[..p],
                        None => line,
                    };
                    let size = parse_hex(size_part)?;
                    if size == 0 {
                        self.state = State::Trailer;
                    } else {
                        self.state = State::Data { remaining: size };
                    }
                }
                State::Data { remaining } => {
                    if buf.is_empty() {
                        return Ok(ChunkEvent::NeedMore);
                    }
                    let take = (*remaining).min(buf.len() as u64) as usize;
                    let data = buf.split_to(take).freeze();
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        self.state = State::DataCrlf;
                    }
                    return Ok(ChunkEvent::Data(data));
                }
                State::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(ChunkEvent::NeedMore);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(CodecError::Parse("missing CRLF after chunk data".into()));
                    }
                    buf.advance(2);
                    self.state = State::Size;
                }
                State::Trailer => {
                    let Some(line_end) = find_crlf(buf) else {
                        return Ok(ChunkEvent::NeedMore);
                    };
                    let line = buf.split_to(line_end + 2);
                    let line = &line[..line_end];
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(ChunkEvent::Done);
                    }
                    if let Some(colon) = line.iter().position(|&b| b == b':') {
                        let name = HeaderName::from_bytes(&line[..colon]);
                        let value = HeaderValue::from_bytes(trim(&line[colon + 1..]));
                        if let (Ok(name), Ok(value)) = (name, value) {
                            self.trailers.append(name, value);
                        }
                    }
                }
                State::Done => return Ok(ChunkEvent::Done),
            }
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_hex(bytes: &[u8]) -> Result<u64, CodecError> {
    if bytes.is_empty() || bytes.len() > 16 {
        return Err(CodecError::Parse("invalid chunk size".into()));
    }
    let mut size: u64 = 0;
    for &b in bytes {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(CodecError::Parse("invalid chunk size".into())),
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(digit as u64))
            .ok_or_else(|| CodecError::Parse("chunk size overflow".into()))?;
    }
    Ok(size)
}

fn trim(mut v: &[u8]) -> &[u8] {
    while v.first() == Some(&b' ') || v.first() == Some(&b'\t') {
        v = &v[1..];
    }
    while v.last() == Some(&b' ') || v.last() == Some(&b'\t') {
        v = &v[..v.len() - 1];
    }
    v
}

/// Frame one chunk of data.
pub fn encode_chunk(data: &[u8], dst: &mut BytesMut) {
    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// Terminal chunk with no trailers.
pub fn encode_final(dst: &mut BytesMut) {
    dst.extend_from_slice(b"0\r\n\r\n");
}
