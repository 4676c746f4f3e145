//! Incremental request-head parsing.
//!
//! `parse_head` is called whenever more bytes arrive; it either takes
//! a complete head off the front of the buffer, reports that more
//! bytes are needed, or fails. The size cap counts the head bytes
//! only: a head of exactly the cap still parses, one byte more fails.
//!
//! httparse only speaks HTTP/1.x. When it trips over the version
//! token, the request line is re-examined so that an old (`HTTP/0.9`)
//! or future (`HTTP/2.0`) peer gets the version-specific rejection
//! instead of a generic parse failure.

use bytes::{Buf, BytesMut};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, Version};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::proto::RequestHead;

const MAX_HEADERS: usize = 100;

/// Tries to parse a head from the front of `buf`, consuming it on
/// success. `Ok(None)` means the head is still incomplete.
pub(crate) fn parse_head(buf: &mut BytesMut, max_size: usize) -> Result<Option<RequestHead>> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    trace!("parse_head([u8; {}])", buf.len());

    let len = match req.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > max_size {
                debug!("request head not complete within {} bytes", max_size);
                return Err(Error::new_too_large());
            }
            return Ok(None);
        }
        Err(httparse::Error::Version) => return Err(sniff_version(buf)),
        Err(e) => return Err(e.into()),
    };
    if len > max_size {
        debug!("request head of {} bytes exceeds cap {}", len, max_size);
        return Err(Error::new_too_large());
    }

    let method = Method::from_bytes(req.method.expect("complete parse").as_bytes())
        .map_err(|_| Error::new_head_parse())?;
    let target = req.path.expect("complete parse").to_owned();
    let version = if req.version.expect("complete parse") == 1 {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let mut header_map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::new_bad_header())?;
        let value =
            HeaderValue::from_bytes(header.value).map_err(|_| Error::new_bad_header())?;
        header_map.append(name, value);
    }

    buf.advance(len);
    trace!("parsed head: {} {} {:?}", method, target, version);
    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers: header_map,
    }))
}

/// Classifies a request line httparse rejected for its version token.
fn sniff_version(buf: &[u8]) -> Error {
    let line_end = buf
        .iter()
        .position(|&b| b == b'\r' || b == b'\n')
        .unwrap_or(buf.len());
    let line = &buf[..line_end];

    let token = match line.rsplit(|&b| b == b' ').next() {
        Some(token) => token,
        None => return Error::new_version_parse(),
    };
    let digits = match token.strip_prefix(&b"HTTP/"[..]) {
        Some(digits) => digits,
        None => return Error::new_version_parse(),
    };
    let major = match digits.split(|&b| b == b'.').next() {
        Some(major) if !major.is_empty() => major,
        _ => return Error::new_version_parse(),
    };
    let major = match std::str::from_utf8(major).ok().and_then(|s| s.parse::<u32>().ok()) {
        Some(major) => major,
        None => return Error::new_version_parse(),
    };

    if major < 1 {
        Error::new_version_too_old("HTTP/1.1")
    } else if major > 1 {
        Error::new_version_too_new()
    } else {
        // An HTTP/1.x minor httparse does not know.
        Error::new_version_parse()
    }
}

/// The request's body length per its `Content-Length` headers.
///
/// Several equal values collapse; differing values are malformed. A
/// `Transfer-Encoding` header is refused outright: this server does
/// not speak chunked uploads, and ignoring the header would
/// desynchronise the connection.
pub(crate) fn body_length(headers: &HeaderMap) -> Result<u64> {
    if headers.contains_key(TRANSFER_ENCODING) {
        debug!("request with transfer-encoding refused");
        return Err(Error::new_bad_header());
    }
    let mut length: Option<u64> = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok());
        let parsed = match parsed {
            Some(parsed) => parsed,
            None => return Err(Error::new_bad_header()),
        };
        match length {
            Some(existing) if existing != parsed => {
                debug!("conflicting Content-Length headers");
                return Err(Error::new_bad_header());
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}
