//! The request facade handed to handlers.
//!
//! A [`Request`] is an immutable view of one parsed exchange: the head,
//! the parameters bound during route matching, the query multimap, and
//! a body handle that can be taken by at most one consumer. Clones are
//! cheap and share the same exchange state, which is how the error
//! handler chain can still observe the request a failed handler was
//! invoked with.

use std::fmt;
use std::sync::{Arc, Mutex};

use http::header::HeaderMap;
use http::{Method, Version};

use crate::body::Body;

/// An inbound HTTP request.
#[derive(Clone)]
pub struct Request {
    inner: Arc<Inner>,
}

struct Inner {
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
    params: Vec<Param>,
    query: Vec<QueryPair>,
    body: Mutex<Option<Body>>,
}

/// One bound path parameter: the segment as the client sent it, and
/// its percent-decoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Param {
    pub(crate) name: String,
    pub(crate) raw: String,
    pub(crate) decoded: String,
}

/// One query pair, raw and decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueryPair {
    pub(crate) raw_key: String,
    pub(crate) key: String,
    pub(crate) raw_value: String,
    pub(crate) value: String,
}

impl Request {
    pub(crate) fn new(
        method: Method,
        target: String,
        version: Version,
        headers: HeaderMap,
        params: Vec<Param>,
        query: Vec<QueryPair>,
        body: Body,
    ) -> Request {
        Request {
            inner: Arc::new(Inner {
                method,
                target,
                version,
                headers,
                params,
                query,
                body: Mutex::new(Some(body)),
            }),
        }
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    /// The request target exactly as it appeared on the request line.
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// A path parameter bound during routing, percent-decoded.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner
            .params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.decoded.as_str())
    }

    /// A path parameter as the client sent it, still encoded.
    pub fn param_raw(&self, name: &str) -> Option<&str> {
        self.inner
            .params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.raw.as_str())
    }

    /// The first query value under `key`, percent-decoded.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.inner
            .query
            .iter()
            .find(|q| q.key == key)
            .map(|q| q.value.as_str())
    }

    /// Every query value under `key`, percent-decoded, in order.
    pub fn query_all(&self, key: &str) -> Vec<&str> {
        self.inner
            .query
            .iter()
            .filter(|q| q.key == key)
            .map(|q| q.value.as_str())
            .collect()
    }

    /// The first query value under `key` as the client sent it.
    pub fn query_raw(&self, key: &str) -> Option<&str> {
        self.inner
            .query
            .iter()
            .find(|q| q.key == key)
            .map(|q| q.raw_value.as_str())
    }

    /// Takes the body handle. At most one caller gets it; everyone
    /// after sees `None`.
    pub fn take_body(&self) -> Option<Body> {
        self.inner.body.lock().unwrap().take()
    }

    /// True while nothing has taken the body yet.
    pub(crate) fn body_untaken(&self) -> bool {
        self.inner.body.lock().unwrap().is_some()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.inner.method)
            .field("target", &self.inner.target)
            .field("version", &self.inner.version)
            .finish()
    }
}
