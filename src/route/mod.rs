//! Routes, their patterns, and the registry.
//!
//! A route is an ordered tuple of segments: static literals, `:named`
//! positional parameters, and an optional trailing `*catchall`. Routes
//! carry the endpoints registered on them; the registry in [`tree`]
//! stores routes by segment shape and resolves request paths to them.

pub(crate) mod normalize;
pub(crate) mod select;
pub(crate) mod tree;

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handler::Endpoint;

/// One segment of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Param(String),
    CatchAll(String),
}

/// A registered (or registrable) route: a pattern plus its handlers.
#[derive(Clone)]
pub struct Route {
    inner: Arc<Inner>,
}

struct Inner {
    pattern: String,
    segments: Vec<Segment>,
    endpoints: Vec<Endpoint>,
}

/// Builds a [`Route`] from a pattern and a set of endpoints.
pub struct Builder {
    pattern: String,
    segments: Vec<Segment>,
    endpoints: Vec<Endpoint>,
}

impl Route {
    /// Starts a route for `pattern`.
    ///
    /// Patterns are `/`-delimited; a segment starting with `:` names a
    /// positional parameter and a final segment starting with `*` a
    /// catch-all, e.g. `/users/:id/items/*rest`.
    pub fn builder(pattern: &str) -> Result<Builder> {
        let segments = parse_pattern(pattern)?;
        Ok(Builder {
            pattern: pattern.to_owned(),
            segments,
            endpoints: Vec::new(),
        })
    }

    /// The pattern this route was built from.
    pub fn pattern(&self) -> &str {
        &self.inner.pattern
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.inner.segments
    }

    pub(crate) fn endpoints(&self) -> &[Endpoint] {
        &self.inner.endpoints
    }

    /// Identity, not equivalence: true only for clones of one route.
    pub(crate) fn is_same(&self, other: &Route) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Builder {
    /// Adds an endpoint, refusing one that collides with an already
    /// added handler on the (method, consumes, produces) key.
    pub fn endpoint(mut self, endpoint: Endpoint) -> Result<Builder> {
        if self.endpoints.iter().any(|e| e.collides_with(&endpoint)) {
            return Err(Error::new_user_handler_collision());
        }
        self.endpoints.push(endpoint);
        Ok(self)
    }

    pub fn build(self) -> Result<Route> {
        if self.endpoints.is_empty() {
            return Err(Error::new_user_route_pattern(format!(
                "route {} has no handlers",
                self.pattern
            )));
        }
        Ok(Route {
            inner: Arc::new(Inner {
                pattern: self.pattern,
                segments: self.segments,
                endpoints: self.endpoints,
            }),
        })
    }
}

pub(crate) fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    if !pattern.starts_with('/') {
        return Err(Error::new_user_route_pattern(format!(
            "pattern must start with '/': {}",
            pattern
        )));
    }

    let mut segments = Vec::new();
    let mut names: Vec<&str> = Vec::new();
    for part in pattern.split('/') {
        if part.is_empty() {
            continue;
        }
        if let Some(seg) = segments.last() {
            if matches!(seg, Segment::CatchAll(_)) {
                return Err(Error::new_user_route_pattern(format!(
                    "catch-all must be the last segment: {}",
                    pattern
                )));
            }
        }
        if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(Error::new_user_route_pattern(format!(
                    "parameter segment without a name: {}",
                    pattern
                )));
            }
            if names.contains(&name) {
                return Err(Error::new_user_route_pattern(format!(
                    "duplicate parameter name {:?}: {}",
                    name, pattern
                )));
            }
            names.push(name);
            segments.push(Segment::Param(name.to_owned()));
        } else if let Some(name) = part.strip_prefix('*') {
            if name.is_empty() {
                return Err(Error::new_user_route_pattern(format!(
                    "catch-all segment without a name: {}",
                    pattern
                )));
            }
            if names.contains(&name) {
                return Err(Error::new_user_route_pattern(format!(
                    "duplicate parameter name {:?}: {}",
                    name, pattern
                )));
            }
            names.push(name);
            segments.push(Segment::CatchAll(name.to_owned()));
        } else {
            segments.push(Segment::Literal(part.to_owned()));
        }
    }
    Ok(segments)
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("pattern", &self.inner.pattern)
            .field("endpoints", &self.inner.endpoints.len())
            .finish()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("route::Builder")
            .field("pattern", &self.pattern)
            .finish()
    }
}
