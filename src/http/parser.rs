use crate::http::request::{Method, Request};
use std::collections::HashMap;

/// Upper bound on the request head; anything larger is rejected.
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Upper bound on a request body, after chunked decoding.
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Chunked framing may take at most this many raw bytes per body byte
/// before the request is treated as oversized.
const CHUNK_FRAMING_FACTOR: usize = 2;

#[derive(Debug)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    UnsupportedTransferEncoding,
    HeadersTooLarge,
    BodyTooLarge,
    Incomplete,
}

pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {

    // Look for header/body separator
    let headers_end = match find_headers_end(buf) {
        Some(end) => end,
        None if buf.len() > MAX_HEADER_BYTES => return Err(ParseError::HeadersTooLarge),
        None => return Err(ParseError::Incomplete),
    };
    let header_bytes = &buf[..headers_end];
    let body_bytes = &buf[headers_end + 4..];

    let headers_str = std::str::from_utf8(header_bytes)
        .map_err(|_| ParseError::InvalidRequest)?;

    let mut lines = headers_str.split("\r\n");

    // Request line
    let request_line = lines.next().ok_or(ParseError::InvalidRequest);
    let mut parts = request_line?.split_whitespace();

    let method_str = parts.next().ok_or(ParseError::InvalidRequest)?;
    let path = parts.next().ok_or(ParseError::InvalidRequest)?;
    let version = parts.next().ok_or(ParseError::InvalidRequest)?;

    let method = Method::from_str(method_str).ok_or(ParseError::InvalidMethod)?;

    // Headers
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        let (key, value) = line
            .split_once(':')
            .ok_or(ParseError::InvalidHeader)?;

        headers.insert(
           key.trim().to_string(),
           value.trim().to_string(),
        );
    }

    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    };

    let chunked = match header("Transfer-Encoding") {
        None => false,
        Some(v) if v.eq_ignore_ascii_case("identity") => false,
        Some(v) if v.eq_ignore_ascii_case("chunked") => true,
        Some(_) => return Err(ParseError::UnsupportedTransferEncoding),
    };

    // Body
    let (body, body_consumed) = if chunked {
        match decode_chunked(body_bytes) {
            Err(ParseError::Incomplete)
                if body_bytes.len() > MAX_BODY_BYTES * CHUNK_FRAMING_FACTOR =>
            {
                return Err(ParseError::BodyTooLarge);
            }
            other => other?,
        }
    } else {
        let content_length = header("Content-Length")
            .map(|v| v.parse::<usize>().map_err(|_| ParseError::InvalidContentLength))
            .transpose()?
            .unwrap_or(0);

        if content_length > MAX_BODY_BYTES {
            return Err(ParseError::BodyTooLarge);
        }

        if body_bytes.len() < content_length {
            return Err(ParseError::Incomplete);
        }

        (body_bytes[..content_length].to_vec(), content_length)
    };

    // A decoded chunked body travels on with an explicit length
    if chunked {
        headers.retain(|k, _| {
            !k.eq_ignore_ascii_case("Transfer-Encoding") && !k.eq_ignore_ascii_case("Content-Length")
        });
        headers.insert("Content-Length".to_string(), body.len().to_string());
    }

    let request = Request {
        method,
        path: path.to_string(),
        version: version.to_string(),
        headers,
        body,
    };

    let total_consumed = headers_end + 4 + body_consumed;
    Ok((request, total_consumed))

}

/// Decode a chunked body, returning the payload and the raw bytes consumed
/// including the terminating chunk and any trailers.
fn decode_chunked(buf: &[u8]) -> Result<(Vec<u8>, usize), ParseError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = pos + find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
        let line = std::str::from_utf8(&buf[pos..line_end]).map_err(|_| ParseError::InvalidChunk)?;
        let size = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size, 16).map_err(|_| ParseError::InvalidChunk)?;
        pos = line_end + 2;

        if size == 0 {
            break;
        }
        if size > MAX_BODY_BYTES - body.len() {
            return Err(ParseError::BodyTooLarge);
        }
        if buf.len() < pos + size + 2 {
            return Err(ParseError::Incomplete);
        }
        if &buf[pos + size..pos + size + 2] != b"\r\n" {
            return Err(ParseError::InvalidChunk);
        }

        body.extend_from_slice(&buf[pos..pos + size]);
        pos += size + 2;
    }

    // Trailer section ends with an empty line
    loop {
        let line_end = pos + find_crlf(&buf[pos..]).ok_or(ParseError::Incomplete)?;
        let empty = line_end == pos;
        pos = line_end + 2;
        if empty {
            return Ok((body, pos));
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
}
