//! Pieces pertaining to the HTTP message protocol.

pub(crate) mod h1;

use http::header::HeaderMap;
use http::{Method, Version};

/// A parsed request head.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
}
