//! Request-target normalisation.
//!
//! Turns the raw request target into the segment lists the registry
//! matches on: slashes collapsed, trailing slashes stripped, dot
//! segments resolved, and every segment percent-decoded as UTF-8 with
//! `+` kept literal. The pre-decode segments are carried along so
//! catch-all bindings and raw parameter views can preserve exactly
//! what the client sent.

use percent_encoding::percent_decode_str;

use crate::error::{Error, Result};
use crate::request::QueryPair;

/// A normalised request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    /// Normalised segments, still percent-encoded.
    pub(crate) raw_segments: Vec<String>,
    /// The same segments, percent-decoded.
    pub(crate) segments: Vec<String>,
    /// The normalised path, re-joined; `/` for the root.
    pub(crate) path: String,
    /// Query pairs in client order.
    pub(crate) query: Vec<QueryPair>,
}

pub(crate) fn normalize(target: &str) -> Result<Target> {
    let (path, query) = match target.find('?') {
        Some(at) => (&target[..at], Some(&target[at + 1..])),
        None => (target, None),
    };

    // Splitting and dropping empty segments collapses runs of `/` and
    // strips the trailing one in a single pass.
    let mut raw_segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                // Underflow discards the dot-dot.
                let _ = raw_segments.pop();
            }
            other => raw_segments.push(other),
        }
    }

    let mut segments = Vec::with_capacity(raw_segments.len());
    for raw in &raw_segments {
        segments.push(decode(raw)?);
    }

    let mut normalised = String::with_capacity(path.len());
    for raw in &raw_segments {
        normalised.push('/');
        normalised.push_str(raw);
    }
    if normalised.is_empty() {
        normalised.push('/');
    }

    let query = match query {
        Some(q) => parse_query(q)?,
        None => Vec::new(),
    };

    Ok(Target {
        raw_segments: raw_segments.into_iter().map(str::to_owned).collect(),
        segments,
        path: normalised,
        query,
    })
}

/// Percent-decodes one segment. `+` stays `+`.
fn decode(segment: &str) -> Result<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .map_err(|_| Error::new_head_parse())
}

fn parse_query(query: &str) -> Result<Vec<QueryPair>> {
    let mut pairs = Vec::new();
    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        let (raw_key, raw_value) = match part.find('=') {
            Some(at) => (&part[..at], &part[at + 1..]),
            None => (part, ""),
        };
        pairs.push(QueryPair {
            key: decode(raw_key)?,
            raw_key: raw_key.to_owned(),
            value: decode(raw_value)?,
            raw_value: raw_value.to_owned(),
        });
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(target: &str) -> Vec<String> {
        normalize(target).unwrap().segments
    }

    #[test]
    fn collapses_and_strips_slashes() {
        assert_eq!(segs("//a///b//"), vec!["a", "b"]);
        assert_eq!(normalize("///").unwrap().path, "/");
        assert_eq!(normalize("/").unwrap().path, "/");
    }

    #[test]
    fn resolves_dot_segments() {
        assert_eq!(segs("/a/./b"), vec!["a", "b"]);
        assert_eq!(segs("/a/c/../b"), vec!["a", "b"]);
        assert_eq!(segs("/../a"), vec!["a"]);
        assert_eq!(segs("/a/b/.."), vec!["a"]);
    }

    #[test]
    fn percent_decodes_segments_with_literal_plus() {
        assert_eq!(segs("/John%20Doe"), vec!["John Doe"]);
        assert_eq!(segs("/a+b"), vec!["a+b"]);
        let t = normalize("/John%20Doe").unwrap();
        assert_eq!(t.raw_segments, vec!["John%20Doe"]);
    }

    #[test]
    fn normalisation_is_idempotent() {
        let once = normalize("//a/.././b%20c/").unwrap();
        let twice = normalize(&once.path).unwrap();
        assert_eq!(once.segments, twice.segments);
    }

    #[test]
    fn splits_query_pairs_in_order() {
        let t = normalize("/p?a=1&b=%2F&a=2&flag").unwrap();
        assert_eq!(t.query.len(), 4);
        assert_eq!(t.query[0].key, "a");
        assert_eq!(t.query[0].value, "1");
        assert_eq!(t.query[1].value, "/");
        assert_eq!(t.query[1].raw_value, "%2F");
        assert_eq!(t.query[2].value, "2");
        assert_eq!(t.query[3].key, "flag");
        assert_eq!(t.query[3].value, "");
    }
}
