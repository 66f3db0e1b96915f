//! Bounded HTTP head codec
//!
//! Parses and formats HTTP/1.x start lines plus headers. Bodies are never
//! read: CONNECT exchanges carry none, so the first byte after the blank line
//! already belongs to the tunnel and is left untouched for the caller.

use crate::{Error, Result};
use bytes::{Buf, BytesMut};
use httparse::Status;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Maximum number of head bytes accepted from a peer (1 MiB).
pub const HEADER_LIMIT: usize = 1024 * 1024;

/// Header slots tried first.
const INITIAL_HEADER_SLOTS: usize = 64;

/// Shortest possible header line is `a:\n`.
///
/// Slots are only grown to the number of lines actually buffered, so the
/// transient `httparse::Header` array (32 bytes per slot on 64-bit) is
/// proportional to the head received. The worst case, a full `HEADER_LIMIT`
/// of bare `a:\n` lines, allocates about 11 MiB for the duration of one parse.
const MAX_HEADER_SLOTS: usize = HEADER_LIMIT / 3;

const READ_CHUNK: usize = 8 * 1024;

/// Ordered header list, names and values exactly as received.
///
/// Values stay raw bytes: HTTP allows obs-text (0x80-0xFF) in field values.
pub type Headers = Vec<(String, Vec<u8>)>;

/// Request line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Headers,
}

impl RequestHead {
    /// First header value with the given name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        find_header(&self.headers, name)
    }
}

/// Status line plus headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn find_header<'a>(headers: &'a Headers, name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_slice())
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Headers {
    raw.iter()
        .map(|h| (h.name.to_string(), h.value.to_vec()))
        .collect()
}

/// Slots enough for every header line buffered so far
fn header_slots(buf: &[u8]) -> usize {
    buf.iter()
        .filter(|&&b| b == b'\n')
        .count()
        .min(MAX_HEADER_SLOTS)
}

/// Check the size bound for an incomplete head.
fn check_partial(buf: &[u8]) -> Result<()> {
    if buf.len() > HEADER_LIMIT {
        return Err(Error::HeaderTooLarge(HEADER_LIMIT));
    }
    Ok(())
}

fn check_complete(len: usize) -> Result<()> {
    if len > HEADER_LIMIT {
        return Err(Error::HeaderTooLarge(HEADER_LIMIT));
    }
    Ok(())
}

/// Parse a request head from the start of `buf`.
///
/// Returns `Ok(None)` while the head is incomplete, or the head together with
/// the number of bytes it occupies. Anything past that offset is not looked at.
pub fn parse_request(buf: &[u8]) -> Result<Option<(RequestHead, usize)>> {
    let mut slots = INITIAL_HEADER_SLOTS;
    loop {
        let mut raw = vec![httparse::EMPTY_HEADER; slots];
        let mut req = httparse::Request::new(&mut raw);
        match req.parse(buf) {
            Ok(Status::Complete(len)) => {
                check_complete(len)?;
                let method = req
                    .method
                    .ok_or_else(|| Error::malformed("Missing request method"))?;
                let target = req
                    .path
                    .ok_or_else(|| Error::malformed("Missing request target"))?;
                let head = RequestHead {
                    method: method.to_string(),
                    target: target.to_string(),
                    headers: collect_headers(req.headers),
                };
                return Ok(Some((head, len)));
            }
            Ok(Status::Partial) => {
                check_partial(buf)?;
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) if header_slots(buf) > slots => {
                slots = header_slots(buf);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Parse a response head from the start of `buf`.
pub fn parse_response(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut slots = INITIAL_HEADER_SLOTS;
    loop {
        let mut raw = vec![httparse::EMPTY_HEADER; slots];
        let mut res = httparse::Response::new(&mut raw);
        match res.parse(buf) {
            Ok(Status::Complete(len)) => {
                check_complete(len)?;
                let status = res
                    .code
                    .ok_or_else(|| Error::malformed("Missing status code"))?;
                let head = ResponseHead {
                    status,
                    reason: res.reason.unwrap_or_default().to_string(),
                    headers: collect_headers(res.headers),
                };
                return Ok(Some((head, len)));
            }
            Ok(Status::Partial) => {
                check_partial(buf)?;
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) if header_slots(buf) > slots => {
                slots = header_slots(buf);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn push_headers<N: AsRef<str>, V: AsRef<[u8]>>(out: &mut Vec<u8>, headers: &[(N, V)]) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_ref().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_ref());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

/// Format `METHOD target HTTP/1.1` plus headers and the blank line.
pub fn serialize_request<N: AsRef<str>, V: AsRef<[u8]>>(
    method: &str,
    target: &str,
    headers: &[(N, V)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + headers.len() * 32);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.extend_from_slice(b" HTTP/1.1\r\n");
    push_headers(&mut out, headers);
    out
}

/// Format `HTTP/1.1 status reason` plus headers and the blank line.
///
/// Without an explicit reason the canonical phrase for `status` is used.
pub fn serialize_response<N: AsRef<str>, V: AsRef<[u8]>>(
    status: u16,
    reason: Option<&str>,
    headers: &[(N, V)],
) -> Vec<u8> {
    let reason = reason.unwrap_or_else(|| canonical_reason(status));
    let mut out = Vec::with_capacity(32 + reason.len() + headers.len() * 32);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    push_headers(&mut out, headers);
    out
}

fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Incremental reader for exactly one head.
///
/// Reads from the stream in chunks until a head is complete; bytes read past
/// the head stay in the cache and are handed out by [`HeadReader::into_residue`].
#[derive(Debug, Default)]
pub struct HeadReader {
    cache: BytesMut,
    scanned: usize,
    start_line_checked: bool,
    used: bool,
}

impl HeadReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read_request<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<RequestHead> {
        self.read_head(reader, parse_request).await
    }

    pub async fn read_response<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<ResponseHead> {
        self.read_head(reader, parse_response).await
    }

    /// Bytes received after the head
    pub fn into_residue(self) -> BytesMut {
        self.cache
    }

    async fn read_head<R, T>(
        &mut self,
        reader: &mut R,
        parse: fn(&[u8]) -> Result<Option<(T, usize)>>,
    ) -> Result<T>
    where
        R: AsyncRead + Unpin,
    {
        if self.used {
            return Err(Error::invalid_state("Head reader already used"));
        }
        self.used = true;

        loop {
            if self.scan() {
                if let Some((head, len)) = parse(&self.cache)? {
                    self.cache.advance(len);
                    return Ok(head);
                }
            }
            check_partial(&self.cache)?;

            self.cache.reserve(READ_CHUNK);
            let n = reader.read_buf(&mut self.cache).await?;
            if n == 0 {
                return Err(Error::malformed("Connection closed before end of header"));
            }
        }
    }

    /// Scan new bytes; true once a blank line has been seen.
    ///
    /// The start line is validated as soon as it is complete so garbage is
    /// rejected without waiting for a terminator.
    fn scan(&mut self) -> bool {
        let buf = &self.cache[..];
        let start = self.scanned.saturating_sub(2);
        let mut found = false;
        let mut first_newline = false;

        for i in start..buf.len() {
            if buf[i] != b'\n' {
                continue;
            }
            first_newline = true;
            let rest = &buf[i + 1..];
            if rest.starts_with(b"\n") || rest.starts_with(b"\r\n") {
                found = true;
                break;
            }
        }
        self.scanned = buf.len();

        if first_newline && !self.start_line_checked {
            self.start_line_checked = true;
            // Grammar errors in the start line surface on the next parse.
            return true;
        }
        found
    }
}
