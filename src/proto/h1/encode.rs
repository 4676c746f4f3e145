//! Response head serialisation and body length enforcement.

use std::time::SystemTime;

use bytes::BytesMut;
use http::header::DATE;
use http::Version;
use tracing::trace;

use crate::error::{Error, Fault, Result};
use crate::response::Response;

const AVERAGE_HEADER_SIZE: usize = 30;

/// Writes the status line and header block of `response` into `dst`.
///
/// Final responses get a `Date` header unless the application set
/// one; interim responses never carry a date.
pub(crate) fn encode_head(dst: &mut BytesMut, response: &Response, version: Version) {
    let headers = response.headers();
    dst.reserve(30 + (headers.len() + 1) * AVERAGE_HEADER_SIZE);

    match version {
        Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
        _ => dst.extend_from_slice(b"HTTP/1.1 "),
    }
    dst.extend_from_slice(response.status().as_str().as_bytes());
    dst.extend_from_slice(b" ");
    let reason = response
        .reason()
        .or_else(|| response.status().canonical_reason())
        .unwrap_or("");
    dst.extend_from_slice(reason.as_bytes());
    dst.extend_from_slice(b"\r\n");

    for (name, value) in headers.iter() {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    if !response.is_interim() && !headers.contains_key(DATE) {
        dst.extend_from_slice(b"date: ");
        dst.extend_from_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
    trace!("encoded head for {}", response.status());
}

/// Bounds body bytes against what the head promised.
#[derive(Debug, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq)]
enum Kind {
    /// `Content-Length` is set; yielding more is an application fault.
    Length(u64),
    /// No length known: the body runs until the connection closes.
    CloseDelimited,
}

/// The body producer stopped short of its `Content-Length`.
#[derive(Debug)]
pub(crate) struct NotEof(pub(crate) u64);

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn close_delimited() -> Encoder {
        Encoder {
            kind: Kind::CloseDelimited,
        }
    }

    /// Accounts for one chunk about to be written.
    pub(crate) fn encode(&mut self, len: u64) -> Result<()> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if len > *remaining {
                    return Err(Error::new_illegal_body(
                        Fault::App,
                        "body producer exceeded Content-Length",
                    ));
                }
                *remaining -= len;
                Ok(())
            }
            Kind::CloseDelimited => Ok(()),
        }
    }

    /// Whether the connection must close once the body ends.
    pub(crate) fn is_close_delimited(&self) -> bool {
        matches!(self.kind, Kind::CloseDelimited)
    }

    /// Called at end of body; reports bytes still owed.
    pub(crate) fn end(&self) -> std::result::Result<(), NotEof> {
        match self.kind {
            Kind::Length(0) | Kind::CloseDelimited => Ok(()),
            Kind::Length(remaining) => Err(NotEof(remaining)),
        }
    }
}
