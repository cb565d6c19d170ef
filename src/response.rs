//! Range extraction and response-head assembly.
//!
//! The response side of the wire protocol is a fixed shape: a status line
//! (`200 OK` or `206 Partial Content`), the length/range headers, a constant
//! content type, and a `Last-Modified` derived from the backing object. The
//! head is assembled into a single pre-sized [`Bytes`] so the socket sees one
//! write before body streaming starts.

use crate::prelude::*;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

/// The single supported media type.
pub const CONTENT_TYPE: &str = "video/mp4";
/// `Server` header value.
pub const SERVER: &str = concat!("strombox/", env!("CARGO_PKG_VERSION"));

/// IMF-fixdate, the HTTP date format (`Sun, 06 Nov 1994 08:49:37 GMT`).
const HTTP_DATE: &[FormatItem] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Extracts the skip offset from a `Range` header, if one is usable.
///
/// Only the form `bytes=<offset>-…` is honored and only its lower bound;
/// anything after the first dash is ignored. A missing or malformed header
/// yields `None`: serve the whole object with a `200`.
#[must_use]
pub fn range_offset(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes=")?;
    let lower = match range.find('-') {
        Some(0) => return None,
        Some(index) => &range[..index],
        None => range,
    };
    lower.trim().parse().ok()
}

/// Builds the complete response head for an object of `size` bytes served
/// from `skip`, terminated by the blank line that precedes the body.
#[must_use]
pub fn stream_head(size: u64, skip: u64, modified: SystemTime) -> Bytes {
    let mut head = BytesMut::with_capacity(256);
    if skip > 0 {
        head.extend_from_slice(b"HTTP/1.1 206 Partial Content\r\n");
        head.extend_from_slice(format!("Content-Length: {}\r\n", size - skip).as_bytes());
        head.extend_from_slice(
            format!("Content-Range: bytes {}-{}/{}\r\n", skip, size - 1, size).as_bytes(),
        );
    } else {
        head.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
        head.extend_from_slice(format!("Content-Length: {size}\r\n").as_bytes());
    }
    head.extend_from_slice(format!("Server: {SERVER}\r\n").as_bytes());
    head.extend_from_slice(format!("Content-Type: {CONTENT_TYPE}\r\n").as_bytes());
    head.extend_from_slice(b"Accept-Ranges: bytes\r\n");
    head.extend_from_slice(format!("Last-Modified: {}\r\n", http_date(modified)).as_bytes());
    head.extend_from_slice(b"\r\n");
    head.freeze()
}

/// Formats `time` as an HTTP date.
///
/// Falls back to the epoch on a formatting failure, which cannot happen for
/// dates the file system hands out.
fn http_date(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&HTTP_DATE)
        .unwrap_or_else(|_| String::from("Thu, 01 Jan 1970 00:00:00 GMT"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(header::RANGE, HeaderValue::from_str(value).unwrap());
        map
    }

    #[test]
    fn range_lower_bound_only() {
        assert_eq!(range_offset(&headers("bytes=500-")), Some(500));
        assert_eq!(range_offset(&headers("bytes=500-999")), Some(500));
        assert_eq!(range_offset(&headers("bytes=0-")), Some(0));
        assert_eq!(range_offset(&headers("bytes=123")), Some(123));
    }

    #[test]
    fn unusable_ranges_mean_whole_object() {
        assert_eq!(range_offset(&HeaderMap::new()), None);
        assert_eq!(range_offset(&headers("bytes=-500")), None);
        assert_eq!(range_offset(&headers("bytes=abc-")), None);
        assert_eq!(range_offset(&headers("items=5-")), None);
        assert_eq!(range_offset(&headers("")), None);
    }

    #[test]
    fn head_for_skip_request() {
        // The 1,000-byte object served from 500.
        let head = stream_head(1000, 500, SystemTime::UNIX_EPOCH);
        let text = str::from_utf8(&head).unwrap();
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Length: 500\r\n"));
        assert!(text.contains("Content-Range: bytes 500-999/1000\r\n"));
        assert!(text.contains("Content-Type: video/mp4\r\n"));
        assert!(text.contains("Accept-Ranges: bytes\r\n"));
        assert!(text.contains("Last-Modified: Thu, 01 Jan 1970 00:00:00 GMT\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn head_for_whole_object() {
        let head = stream_head(1000, 0, SystemTime::UNIX_EPOCH);
        let text = str::from_utf8(&head).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 1000\r\n"));
        assert!(!text.contains("Content-Range"));
    }

    #[test]
    fn http_date_shape() {
        let date = http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777));
        assert_eq!(date, "Sun, 06 Nov 1994 08:49:37 GMT");
    }
}
