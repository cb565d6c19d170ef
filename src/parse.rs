//! Minimal HTTP/1.x request parsing.
//!
//! One request is read per connection: the header block is framed by the
//! first `\r\n\r\n`, the request line and headers are parsed into [`http`]
//! types, and everything else (bodies, later requests on the same socket) is
//! ignored. The parser is deliberately forgiving (a playback component's
//! request must not be refused over a stray header) and leaves usability
//! decisions (is there a `file` parameter?) to the caller.

use crate::prelude::*;
use percent_encoding::percent_decode_str;

/// Initial capacity of the header-block buffer.
const INITIAL_BUFFER: usize = 8 * 1024;
/// A header block larger than this is a bad request, not a growth case.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// Index one past the end of the first `\r\n\r\n` in `buffer[..len]`, if any.
fn headers_end(buffer: &[u8], len: usize) -> Option<usize> {
    buffer[..len]
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|position| position + 4)
}

/// Reads from `reader` until a complete header block is buffered.
///
/// The buffer grows geometrically when the block does not fit. Returns the
/// header block only; any body bytes already read are discarded.
///
/// # Errors
///
/// `InvalidData` if the stream ends (or the size cap is hit) before the
/// terminating blank line.
pub fn read_header_block(reader: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0; INITIAL_BUFFER];
    let mut len = 0;
    loop {
        let read = reader.read(&mut buffer[len..])?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection closed before the header block ended",
            ));
        }
        len += read;
        if let Some(end) = headers_end(&buffer, len) {
            buffer.truncate(end);
            return Ok(buffer);
        }
        if len == buffer.len() {
            if buffer.len() >= MAX_HEADER_BLOCK {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "header block too large",
                ));
            }
            buffer.resize(buffer.len() * 2, 0);
        }
    }
}

/// Parses a buffered header block into a request.
///
/// The first line is `METHOD SP TARGET [SP VERSION]`; the version is ignored.
/// Header keys are case-folded to lowercase (a [`http::HeaderName`]
/// guarantee) and a later duplicate replaces an earlier one. Lines without a
/// colon are skipped. A missing method or target is logged and defaulted
/// (`GET`, `/`); the caller decides whether the result is usable.
#[must_use]
pub fn request(buffer: &[u8]) -> http::Request<()> {
    let mut lines = buffer.split(|byte| *byte == b'\n');
    let request_line = lines.next().unwrap_or(b"");
    let mut tokens = request_line
        .strip_suffix(b"\r")
        .unwrap_or(request_line)
        .split(|byte| *byte == b' ')
        .filter(|token| !token.is_empty());

    let method = match tokens.next() {
        Some(token) => Method::from_bytes(token).unwrap_or(Method::GET),
        None => {
            error!("bad request: empty request line");
            Method::GET
        }
    };
    let target = match tokens.next() {
        Some(token) => Uri::try_from(token).unwrap_or_else(|_| Uri::from_static("/")),
        None => {
            error!("bad request: missing target");
            Uri::from_static("/")
        }
    };

    let mut request = http::Request::builder().method(method).uri(target);
    if let Some(headers) = request.headers_mut() {
        for line in lines {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.iter().position(|byte| *byte == b':') else {
                // No colon: skip the line instead of failing the request.
                continue;
            };
            let name = http::header::HeaderName::from_bytes(trim(&line[..colon]));
            let value = HeaderValue::from_bytes(trim(&line[colon + 1..]));
            if let (Ok(name), Ok(value)) = (name, value) {
                headers.insert(name, value);
            }
        }
    }
    // UNWRAP: method and uri are valid by construction above.
    request.body(()).unwrap()
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// Extracts a query parameter from `uri`, percent-decoded.
///
/// Returns `None` when the parameter is absent; an empty value is `Some("")`,
/// which callers treat the same as absent for the `file` parameter.
#[must_use]
pub fn query_param(uri: &Uri, name: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|member| {
        let (key, value) = member.split_once('=').unwrap_or((member, ""));
        if key != name {
            return None;
        }
        Some(percent_decode_str(value).decode_utf8().ok()?.into_owned())
    })
}
