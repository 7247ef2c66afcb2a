//! HTTP/1.1 wire codec: head parsing/encoding, body framing, and the
//! per-stream state machine that keep-alive connections reuse across
//! requests.

pub mod chunked;
pub mod head;
pub mod stream;

pub use head::{RequestHead, ResponseHead};
pub use stream::HttpStream;

use std::fmt;

/// Body framing resolved from the message headers. Exactly one of
/// Content-Length / chunked applies to a body; both present is an error.
/// `UntilClose` only occurs on responses that carry neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyKind {
    /// Whether the connection can be reused after this body completes.
    pub fn keeps_connection(&self) -> bool {
        !matches!(self, BodyKind::UntilClose)
    }
}

/// Codec-level failure. The caller maps it to the request-path error kind
/// for its side of the exchange (400 for client input, 502 for upstream).
#[derive(Debug)]
pub enum CodecError {
    Io(std::io::Error),
    Parse(String),
    HeadTooLarge,
    /// The stream ended in the middle of a message.
    UnexpectedEof,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Io(e) => write!(f, "io error: {}", e),
            CodecError::Parse(msg) => write!(f, "{}", msg),
            CodecError::HeadTooLarge => write!(f, "header section exceeds limit"),
            CodecError::UnexpectedEof => write!(f, "connection closed mid-message"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e)
    }
}
