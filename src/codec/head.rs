//! Request-line, status-line, and header parsing/encoding.
//!
//! Header names are normalized to lowercase on insert (`http::HeaderName`
//! does this for us) and insertion order is preserved for serialization.
//! Values are trimmed of optional whitespace; obs-folding is rejected.

use super::{BodyKind, CodecError};
use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

const CRLF: &[u8] = b"\r\n";

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Path portion of the request target (without the query string).
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// Resolve the body framing. Both Content-Length and chunked present is
    /// a hard error.
    pub fn body_kind(&self) -> Result<BodyKind, CodecError> {
        body_kind_common(&self.headers, true)
    }
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_string(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    /// Resolve the body framing. Responses with neither framing header are
    /// delimited by connection close; 1xx/204/304 and HEAD responses never
    /// carry a body.
    pub fn body_kind(&self, request_was_head: bool) -> Result<BodyKind, CodecError> {
        if request_was_head
            || self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
        {
            return Ok(BodyKind::Empty);
        }
        body_kind_common(&self.headers, false)
    }
}

fn body_kind_common(headers: &HeaderMap, is_request: bool) -> Result<BodyKind, CodecError> {
    let chunked = match headers.get(TRANSFER_ENCODING) {
        Some(te) => {
            let te = te
                .to_str()
                .map_err(|_| CodecError::Parse("invalid transfer-encoding".into()))?;
            if !te.eq_ignore_ascii_case("chunked") {
                return Err(CodecError::Parse(format!(
                    "unsupported transfer-encoding: {}",
                    te
                )));
            }
            true
        }
        None => false,
    };

    let content_length = match headers.get(CONTENT_LENGTH) {
        Some(cl) => {
            let cl = cl
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| CodecError::Parse("invalid content-length".into()))?;
            Some(cl)
        }
        None => None,
    };

    match (chunked, content_length) {
        (true, Some(_)) => Err(CodecError::Parse(
            "both content-length and chunked framing present".into(),
        )),
        (true, None) => Ok(BodyKind::Chunked),
        (false, Some(0)) => Ok(BodyKind::Empty),
        (false, Some(n)) => Ok(BodyKind::Length(n)),
        (false, None) => {
            if is_request {
                Ok(BodyKind::Empty)
            } else {
                Ok(BodyKind::UntilClose)
            }
        }
    }
}

/// Try to parse a request head from `buf`. Returns the head and the number
/// of bytes consumed, or `None` when the terminator has not arrived yet.
pub fn parse_request_head(
    buf: &[u8],
    max_head_bytes: usize,
) -> Result<Option<(RequestHead, usize)>, CodecError> {
    let Some(end) = find_head_end(buf, max_head_bytes)? else {
        return Ok(None);
    };
    let head = &buf[..end - 4];
    let mut lines = head.split(|&b| b == b'\n').map(trim_cr);

    let request_line = lines.next().ok_or_else(|| err("empty request line"))?;
    let mut parts = request_line.split(|&b| b == b' ').filter(|p| !p.is_empty());
    let method = parts.next().ok_or_else(|| err("missing method"))?;
    let target = parts.next().ok_or_else(|| err("missing request target"))?;
    let version = parts.next().ok_or_else(|| err("missing http version"))?;
    if parts.next().is_some() {
        return Err(err("malformed request line"));
    }

    let method = Method::from_bytes(method).map_err(|_| err("invalid method"))?;
    let target = std::str::from_utf8(target)
        .map_err(|_| err("invalid request target"))?
        .to_string();
    let version = parse_version(version)?;
    let headers = parse_headers(lines)?;

    Ok(Some((
        RequestHead {
            method,
            target,
            version,
            headers,
        },
        end,
    )))
}

/// Try to parse a response head from `buf`.
pub fn parse_response_head(
    buf: &[u8],
    max_head_bytes: usize,
) -> Result<Option<(ResponseHead, usize)>, CodecError> {
    let Some(end) = find_head_end(buf, max_head_bytes)? else {
        return Ok(None);
    };
    let head = &buf[..end - 4];
    let mut lines = head.split(|&b| b == b'\n').map(trim_cr);

    let status_line = lines.next().ok_or_else(|| err("empty status line"))?;
    // "HTTP/1.1 200 OK" — the reason phrase may contain spaces or be empty.
    let mut parts = status_line.splitn(3, |&b| b == b' ');
    let version = parts.next().ok_or_else(|| err("missing http version"))?;
    let status = parts.next().ok_or_else(|| err("missing status code"))?;
    let reason = parts.next().unwrap_or(b"");

    let version = parse_version(version)?;
    let status = std::str::from_utf8(status)
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| err("invalid status code"))?;
    let reason = String::from_utf8_lossy(reason).into_owned();
    let headers = parse_headers(lines)?;

    Ok(Some((
        ResponseHead {
            status,
            reason,
            version,
            headers,
        },
        end,
    )))
}

fn find_head_end(buf: &[u8], max_head_bytes: usize) -> Result<Option<usize>, CodecError> {
    match buf.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => {
            if pos + 4 > max_head_bytes {
                return Err(CodecError::HeadTooLarge);
            }
            Ok(Some(pos + 4))
        }
        None => {
            if buf.len() > max_head_bytes {
                return Err(CodecError::HeadTooLarge);
            }
            Ok(None)
        }
    }
}

fn parse_headers<'a, I>(lines: I) -> Result<HeaderMap, CodecError>
where
    I: Iterator<Item = &'a [u8]>,
{
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(err("obsolete line folding is not supported"));
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| err("header line missing colon"))?;
        let (name, rest) = line.split_at(colon);
        if name.is_empty() || name.last() == Some(&b' ') || name.last() == Some(&b'\t') {
            return Err(err("invalid header name"));
        }
        let value = trim_ows(&rest[1..]);

        let name = HeaderName::from_bytes(name).map_err(|_| err("invalid header name"))?;
        let value = HeaderValue::from_bytes(value).map_err(|_| err("invalid header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn parse_version(v: &[u8]) -> Result<Version, CodecError> {
    match v {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        _ => Err(err("unsupported http version")),
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while let Some((b' ' | b'\t', rest)) = v.split_first().map(|(f, r)| (*f, r)) {
        v = rest;
    }
    while let Some((rest, b' ' | b'\t')) = v.split_last().map(|(l, r)| (r, *l)) {
        v = rest;
    }
    v
}

fn err(msg: &str) -> CodecError {
    CodecError::Parse(msg.to_string())
}

pub fn encode_request_head(head: &RequestHead, dst: &mut BytesMut) {
    dst.extend_from_slice(head.method.as_str().as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(head.target.as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(version_str(head.version));
    dst.extend_from_slice(CRLF);
    encode_headers(&head.headers, dst);
    dst.extend_from_slice(CRLF);
}

pub fn encode_response_head(head: &ResponseHead, dst: &mut BytesMut) {
    dst.extend_from_slice(version_str(head.version));
    dst.extend_from_slice(b" ");
    let mut buf = itoa::Buffer::new();
    dst.extend_from_slice(buf.format(head.status.as_u16()).as_bytes());
    dst.extend_from_slice(b" ");
    dst.extend_from_slice(head.reason.as_bytes());
    dst.extend_from_slice(CRLF);
    encode_headers(&head.headers, dst);
    dst.extend_from_slice(CRLF);
}

fn encode_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(CRLF);
    }
}

fn version_str(v: Version) -> &'static [u8] {
    match v {
        Version::HTTP_10 => b"HTTP/1.0",
        _ => b"HTTP/1.1",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    #[test]
    fn test_parse_simple_request() {
        let raw = b"GET /users?page=2 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let (head, consumed) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/users?page=2");
        assert_eq!(head.path(), "/users");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "example.com");
    }

    #[test]
    fn test_incomplete_head_returns_none() {
        let raw = b"GET / HTTP/1.1\r\nHost: exa";
        assert!(parse_request_head(raw, MAX).unwrap().is_none());
    }

    #[test]
    fn test_header_names_case_insensitive() {
        let raw = b"GET / HTTP/1.1\r\nX-Custom-Header: One\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.headers.get("x-custom-header").unwrap(), "One");
        assert_eq!(head.headers.get("X-CUSTOM-HEADER").unwrap(), "One");
    }

    #[test]
    fn test_header_values_trimmed() {
        let raw = b"GET / HTTP/1.1\r\nX-Pad:   padded value \t\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.headers.get("x-pad").unwrap(), "padded value");
    }

    #[test]
    fn test_obs_folding_rejected() {
        let raw = b"GET / HTTP/1.1\r\nX-Long: a\r\n  continued\r\n\r\n";
        assert!(parse_request_head(raw, MAX).is_err());
    }

    #[test]
    fn test_multi_value_header_order_preserved() {
        let raw = b"GET / HTTP/1.1\r\nVia: a\r\nVia: b\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        let values: Vec<_> = head.headers.get_all("via").iter().collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_head_too_large() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(200));
        match parse_request_head(&raw, 64) {
            Err(CodecError::HeadTooLarge) => {}
            other => panic!("expected HeadTooLarge, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_parse_status_line_with_reason() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let (head, _) = parse_response_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(head.reason, "Not Found");
    }

    #[test]
    fn test_parse_status_line_without_reason() {
        let raw = b"HTTP/1.1 200 \r\n\r\n";
        let (head, _) = parse_response_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.status, StatusCode::OK);
    }

    #[test]
    fn test_body_kind_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 12\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.body_kind().unwrap(), BodyKind::Length(12));
    }

    #[test]
    fn test_body_kind_chunked() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.body_kind().unwrap(), BodyKind::Chunked);
    }

    #[test]
    fn test_both_framings_rejected() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();
        assert!(head.body_kind().is_err());
    }

    #[test]
    fn test_response_without_framing_reads_until_close() {
        let raw = b"HTTP/1.1 200 OK\r\n\r\n";
        let (head, _) = parse_response_head(raw, MAX).unwrap().unwrap();
        assert_eq!(head.body_kind(false).unwrap(), BodyKind::UntilClose);
        assert_eq!(head.body_kind(true).unwrap(), BodyKind::Empty);
    }

    #[test]
    fn test_no_body_statuses() {
        for code in [101u16, 204, 304] {
            let raw = format!("HTTP/1.1 {} X\r\nContent-Length: 10\r\n\r\n", code);
            let (head, _) = parse_response_head(raw.as_bytes(), MAX).unwrap().unwrap();
            assert_eq!(head.body_kind(false).unwrap(), BodyKind::Empty);
        }
    }

    #[test]
    fn test_request_round_trip() {
        let raw = b"PUT /v1/items/7 HTTP/1.1\r\nhost: api.internal\r\ncontent-length: 2\r\nx-tag: a\r\nx-tag: b\r\n\r\n";
        let (head, _) = parse_request_head(raw, MAX).unwrap().unwrap();

        let mut out = BytesMut::new();
        encode_request_head(&head, &mut out);
        let (reparsed, _) = parse_request_head(&out, MAX).unwrap().unwrap();

        assert_eq!(reparsed.method, head.method);
        assert_eq!(reparsed.target, head.target);
        assert_eq!(reparsed.version, head.version);
        assert_eq!(reparsed.headers, head.headers);
    }

    #[test]
    fn test_response_round_trip() {
        let mut head = ResponseHead::new(StatusCode::ACCEPTED);
        head.headers
            .insert("content-length", HeaderValue::from_static("0"));
        let mut out = BytesMut::new();
        encode_response_head(&head, &mut out);
        let (reparsed, _) = parse_response_head(&out, MAX).unwrap().unwrap();
        assert_eq!(reparsed.status, head.status);
        assert_eq!(reparsed.headers, head.headers);
    }
}
