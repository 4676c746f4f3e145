//! HTTP responses and their staged builder.
//!
//! A [`Response`] is immutable once built. The [`Builder`] accumulates
//! parts and `body()` finalises, enforcing the invariants that matter
//! on the wire: a single `Content-Length`, informational responses
//! without payload or connection flags, and the coupling between the
//! close-after-write flags and the `Connection: close` header.

use std::convert::TryFrom;
use std::fmt;
use std::mem;

use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH};
use http::StatusCode;

use crate::body::Body;
use crate::error::{Error, Fault, Result};

/// An HTTP response.
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    body: Body,
    shutdown_output: bool,
    close: bool,
}

/// A staged builder for [`Response`]; `body()` validates and builds.
#[derive(Debug)]
pub struct Builder {
    inner: Result<Parts>,
}

#[derive(Debug)]
struct Parts {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    shutdown_output: bool,
    close: bool,
}

impl Response {
    /// Starts building a response, `200 OK` by default.
    pub fn builder() -> Builder {
        Builder {
            inner: Ok(Parts {
                status: StatusCode::OK,
                reason: None,
                headers: HeaderMap::new(),
                shutdown_output: false,
                close: false,
            }),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The custom reason phrase, if one was set.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// True for `100..=199` responses.
    pub fn is_interim(&self) -> bool {
        self.status.is_informational()
    }

    pub(crate) fn must_close_after_write(&self) -> bool {
        self.close
    }

    pub(crate) fn must_shutdown_output_after_write(&self) -> bool {
        self.shutdown_output
    }

    pub(crate) fn content_length(&self) -> Option<u64> {
        self.body.content_length()
    }

    pub(crate) fn take_body(&mut self) -> Body {
        mem::replace(&mut self.body, Body::empty())
    }

    pub(crate) fn body_known_empty(&self) -> bool {
        self.body.known_empty()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Builder {
    /// Sets the status code.
    pub fn status<T>(self, status: T) -> Builder
    where
        StatusCode: TryFrom<T>,
        <StatusCode as TryFrom<T>>::Error: Into<http::Error>,
    {
        self.and_then(move |mut parts| {
            parts.status = StatusCode::try_from(status)
                .map_err(|_| Error::new_user_response("invalid status code"))?;
            Ok(parts)
        })
    }

    /// Sets a custom reason phrase for the status line.
    pub fn reason<S: Into<String>>(self, reason: S) -> Builder {
        self.and_then(move |mut parts| {
            parts.reason = Some(reason.into());
            Ok(parts)
        })
    }

    /// Appends a header, preserving any already present under the
    /// same name.
    pub fn header<K, V>(self, key: K, value: V) -> Builder
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
    {
        self.and_then(move |mut parts| {
            let name = HeaderName::try_from(key)
                .map_err(|_| Error::new_user_response("invalid header name"))?;
            let value = HeaderValue::try_from(value)
                .map_err(|_| Error::new_user_response("invalid header value"))?;
            parts.headers.append(name, value);
            Ok(parts)
        })
    }

    /// Half-closes the output after this response is written. Implies
    /// `Connection: close`.
    pub fn shutdown_output_after_write(self, value: bool) -> Builder {
        self.and_then(move |mut parts| {
            parts.shutdown_output = value;
            Ok(parts)
        })
    }

    /// Closes the connection after this response is written. Implies
    /// `Connection: close`.
    pub fn close_after_write(self, value: bool) -> Builder {
        self.and_then(move |mut parts| {
            parts.close = value;
            Ok(parts)
        })
    }

    /// Finalises with the given body, validating the response.
    pub fn body<B: Into<Body>>(self, body: B) -> Result<Response> {
        let parts = self.inner?;
        let body = body.into();
        Builder::finish(parts, body)
    }

    fn finish(mut parts: Parts, body: Body) -> Result<Response> {
        if parts.headers.get_all(CONTENT_LENGTH).iter().count() > 1 {
            return Err(Error::new_user_response(
                "response has more than one Content-Length",
            ));
        }

        if parts.status.is_informational() {
            if !body.known_empty() {
                return Err(Error::new_illegal_body(
                    Fault::App,
                    "interim response cannot carry a body",
                ));
            }
            if parts.shutdown_output || parts.close {
                return Err(Error::new_illegal_body(
                    Fault::App,
                    "interim response cannot set a connection flag",
                ));
            }
            if connection_says_close(&parts.headers) {
                return Err(Error::new_illegal_body(
                    Fault::App,
                    "interim response cannot send Connection: close",
                ));
            }
            return Ok(Response {
                status: parts.status,
                reason: parts.reason,
                headers: parts.headers,
                body: Body::empty(),
                shutdown_output: false,
                close: false,
            });
        }

        match body.content_length() {
            Some(len) if len > 0 => {
                let value = HeaderValue::from(len);
                parts.headers.insert(CONTENT_LENGTH, value);
            }
            Some(_) => {
                // Empty body: an explicit application Content-Length
                // (a HEAD handler advertising a length) is kept.
                if !parts.headers.contains_key(CONTENT_LENGTH)
                    && allows_content_length(parts.status)
                {
                    parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                }
            }
            None => {
                // Streaming body of unknown length: close-delimited,
                // so any stale Content-Length would be a lie.
                parts.headers.remove(CONTENT_LENGTH);
                parts.close = true;
            }
        }

        if (parts.shutdown_output || parts.close) && !connection_says_close(&parts.headers)
        {
            parts
                .headers
                .append(CONNECTION, HeaderValue::from_static("close"));
        }

        Ok(Response {
            status: parts.status,
            reason: parts.reason,
            headers: parts.headers,
            body,
            shutdown_output: parts.shutdown_output,
            close: parts.close,
        })
    }

    fn and_then<F>(self, f: F) -> Builder
    where
        F: FnOnce(Parts) -> Result<Parts>,
    {
        Builder {
            inner: self.inner.and_then(f),
        }
    }
}

fn allows_content_length(status: StatusCode) -> bool {
    !matches!(
        status,
        StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    ) && !status.is_informational()
}

pub(crate) fn connection_says_close(headers: &HeaderMap) -> bool {
    connection_has_token(headers, "close")
}

pub(crate) fn connection_says_keep_alive(headers: &HeaderMap) -> bool {
    connection_has_token(headers, "keep-alive")
}

fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sets_content_length_for_known_bodies() {
        let res = Response::builder().body("Hello World!").unwrap();
        assert_eq!(
            res.headers().get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from(12u64)
        );
    }

    #[test]
    fn strips_content_length_for_streamed_bodies() {
        let (_tx, body) = Body::channel();
        let res = Response::builder()
            .header(CONTENT_LENGTH, "999")
            .body(body)
            .unwrap();
        assert!(res.headers().get(CONTENT_LENGTH).is_none());
        assert!(res.must_close_after_write());
    }

    #[test]
    fn duplicate_content_length_is_rejected() {
        let err = Response::builder()
            .header(CONTENT_LENGTH, "3")
            .header(CONTENT_LENGTH, "4")
            .body("abc")
            .unwrap_err();
        assert!(err.is_user());
    }

    #[test]
    fn interim_cannot_carry_body_or_close() {
        let err = Response::builder()
            .status(StatusCode::PROCESSING)
            .body("oops")
            .unwrap_err();
        assert!(err.is_illegal_body());

        let err = Response::builder()
            .status(StatusCode::CONTINUE)
            .close_after_write(true)
            .body(Body::empty())
            .unwrap_err();
        assert!(err.is_illegal_body());

        let err = Response::builder()
            .status(StatusCode::CONTINUE)
            .header(CONNECTION, "close")
            .body(Body::empty())
            .unwrap_err();
        assert!(err.is_illegal_body());
    }

    #[test]
    fn close_flag_adds_connection_close() {
        let res = Response::builder()
            .close_after_write(true)
            .body(Body::empty())
            .unwrap();
        assert!(connection_says_close(res.headers()));
    }

    #[test]
    fn empty_body_keeps_explicit_length() {
        let res = Response::builder()
            .header(CONTENT_LENGTH, "42")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            res.headers().get(CONTENT_LENGTH).unwrap(),
            &HeaderValue::from_static("42")
        );
    }

    #[test]
    fn no_content_omits_content_length() {
        let res = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .unwrap();
        assert!(res.headers().get(CONTENT_LENGTH).is_none());
    }
}
