//! The route registry: a tree keyed by segment shape.
//!
//! Each level holds a map of static literals, at most one parameter
//! child, and at most one catch-all child. Parameter names never
//! influence the shape, so `/a/:x` and `/a/:y` occupy the same slot
//! and collide. A catch-all claims its level exclusively: once
//! `/a/*rest` exists, no sibling may be added under `/a`, and vice
//! versa.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::request::Param;
use crate::route::normalize::Target;
use crate::route::{parse_pattern, Route, Segment};

#[derive(Default)]
struct Node {
    literals: HashMap<String, Node>,
    param: Option<Box<Node>>,
    catch_all: Option<Box<Node>>,
    route: Option<Route>,
}

/// A matched route plus the parameters it bound.
#[derive(Debug)]
pub(crate) struct Match {
    pub(crate) route: Route,
    pub(crate) params: Vec<Param>,
}

/// The server's route store. Lookups take a read lock and never
/// otherwise block; mutations serialise briefly on the write lock.
pub(crate) struct Registry {
    root: RwLock<Node>,
}

impl Registry {
    pub(crate) fn new() -> Registry {
        Registry {
            root: RwLock::new(Node::default()),
        }
    }

    /// Adds a route, refusing any whose shape is already taken.
    pub(crate) fn insert(&self, route: Route) -> Result<()> {
        let mut guard = self.root.write().unwrap();
        let mut node = &mut *guard;
        for segment in route.segments() {
            match segment {
                Segment::Literal(lit) => {
                    if node.catch_all.is_some() {
                        return Err(Error::new_route_collision());
                    }
                    node = node.literals.entry(lit.clone()).or_default();
                }
                Segment::Param(_) => {
                    if node.catch_all.is_some() {
                        return Err(Error::new_route_collision());
                    }
                    node = node.param.get_or_insert_with(Default::default);
                }
                Segment::CatchAll(_) => {
                    if !node.literals.is_empty() || node.param.is_some() {
                        return Err(Error::new_route_collision());
                    }
                    node = node.catch_all.get_or_insert_with(Default::default);
                }
            }
        }
        if node.route.is_some() {
            return Err(Error::new_route_collision());
        }
        node.route = Some(route);
        Ok(())
    }

    /// Removes whatever occupies `pattern`'s shape.
    pub(crate) fn remove_pattern(&self, pattern: &str) -> Result<Option<Route>> {
        let segments = parse_pattern(pattern)?;
        let mut root = self.root.write().unwrap();
        Ok(remove_at(&mut root, &segments, 0, None))
    }

    /// Removes `route` only if the occupant is this very route.
    pub(crate) fn remove(&self, route: &Route) -> bool {
        let mut root = self.root.write().unwrap();
        remove_at(&mut root, route.segments(), 0, Some(route)).is_some()
    }

    /// Resolves a normalised target to a route and its bound params.
    pub(crate) fn lookup(&self, target: &Target) -> Result<Match> {
        let root = self.root.read().unwrap();
        let found = find(&root, &target.segments, 0);
        let (route, catch_all_from) = match found {
            Some(found) => found,
            None => return Err(Error::new_no_route(target.path.clone())),
        };
        let params = bind_params(&route, target, catch_all_from);
        Ok(Match { route, params })
    }
}

/// Depth-first match: static first, then the parameter child, then a
/// catch-all. Returns the route and, when a catch-all consumed the
/// remainder, the index it started at.
fn find(node: &Node, segments: &[String], idx: usize) -> Option<(Route, Option<usize>)> {
    if idx == segments.len() {
        if let Some(route) = &node.route {
            return Some((route.clone(), None));
        }
        // A catch-all matches an empty remainder too.
        if let Some(catch_all) = &node.catch_all {
            if let Some(route) = &catch_all.route {
                return Some((route.clone(), Some(idx)));
            }
        }
        return None;
    }

    if let Some(child) = node.literals.get(&segments[idx]) {
        if let Some(found) = find(child, segments, idx + 1) {
            return Some(found);
        }
    }
    if let Some(child) = &node.param {
        if let Some(found) = find(child, segments, idx + 1) {
            return Some(found);
        }
    }
    if let Some(catch_all) = &node.catch_all {
        if let Some(route) = &catch_all.route {
            return Some((route.clone(), Some(idx)));
        }
    }
    None
}

fn bind_params(route: &Route, target: &Target, catch_all_from: Option<usize>) -> Vec<Param> {
    let mut params = Vec::new();
    for (idx, segment) in route.segments().iter().enumerate() {
        match segment {
            Segment::Literal(_) => {}
            Segment::Param(name) => {
                params.push(Param {
                    name: name.clone(),
                    raw: target.raw_segments[idx].clone(),
                    decoded: target.segments[idx].clone(),
                });
            }
            Segment::CatchAll(name) => {
                let from = catch_all_from.unwrap_or(idx);
                params.push(Param {
                    name: name.clone(),
                    raw: target.raw_segments[from..].join("/"),
                    decoded: target.segments[from..].join("/"),
                });
            }
        }
    }
    params
}

/// Removes the route at the given shape, pruning nodes left empty.
fn remove_at(
    node: &mut Node,
    segments: &[Segment],
    idx: usize,
    identity: Option<&Route>,
) -> Option<Route> {
    if idx == segments.len() {
        if let Some(required) = identity {
            match &node.route {
                Some(found) if found.is_same(required) => {}
                _ => return None,
            }
        }
        return node.route.take();
    }

    let removed = match &segments[idx] {
        Segment::Literal(lit) => {
            let child = node.literals.get_mut(lit)?;
            let removed = remove_at(child, segments, idx + 1, identity);
            if removed.is_some() && child.is_empty() {
                node.literals.remove(lit);
            }
            removed
        }
        Segment::Param(_) => {
            let child = node.param.as_mut()?;
            let removed = remove_at(child, segments, idx + 1, identity);
            if removed.is_some() && child.is_empty() {
                node.param = None;
            }
            removed
        }
        Segment::CatchAll(_) => {
            let child = node.catch_all.as_mut()?;
            let removed = remove_at(child, segments, idx + 1, identity);
            if removed.is_some() && child.is_empty() {
                node.catch_all = None;
            }
            removed
        }
    };
    removed
}

impl Node {
    fn is_empty(&self) -> bool {
        self.route.is_none()
            && self.literals.is_empty()
            && self.param.is_none()
            && self.catch_all.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::handler::Endpoint;
    use crate::request::Request;
    use crate::route::normalize::normalize;

    async fn noop(_req: Request, _ch: Channel) -> Result<()> {
        Ok(())
    }

    fn route(pattern: &str) -> Route {
        Route::builder(pattern)
            .unwrap()
            .endpoint(Endpoint::get(noop))
            .unwrap()
            .build()
            .unwrap()
    }

    fn lookup(reg: &Registry, path: &str) -> Result<Match> {
        reg.lookup(&normalize(path).unwrap())
    }

    #[test]
    fn static_match_wins_over_param() {
        let reg = Registry::new();
        reg.insert(route("/a/specific")).unwrap();
        reg.insert(route("/a/:p")).unwrap();

        let hit = lookup(&reg, "/a/specific").unwrap();
        assert_eq!(hit.route.pattern(), "/a/specific");
        let hit = lookup(&reg, "/a/anything").unwrap();
        assert_eq!(hit.route.pattern(), "/a/:p");
        assert_eq!(hit.params[0].decoded, "anything");
    }

    #[test]
    fn falls_back_to_param_when_static_dead_ends() {
        let reg = Registry::new();
        reg.insert(route("/a/b")).unwrap();
        reg.insert(route("/a/:p/c")).unwrap();

        let hit = lookup(&reg, "/a/b/c").unwrap();
        assert_eq!(hit.route.pattern(), "/a/:p/c");
        assert_eq!(hit.params[0].decoded, "b");
    }

    #[test]
    fn different_segment_counts_are_distinct() {
        let reg = Registry::new();
        reg.insert(route("/a")).unwrap();
        reg.insert(route("/a/:p")).unwrap();
        assert_eq!(lookup(&reg, "/a").unwrap().route.pattern(), "/a");
        assert_eq!(lookup(&reg, "/a/x").unwrap().route.pattern(), "/a/:p");
    }

    #[test]
    fn param_shapes_collide_regardless_of_name() {
        let reg = Registry::new();
        reg.insert(route("/a/:x")).unwrap();
        let err = reg.insert(route("/a/:y")).unwrap_err();
        assert!(err.is_route_collision());
    }

    #[test]
    fn collision_detection_is_order_independent() {
        for flip in &[false, true] {
            let reg = Registry::new();
            let (first, second) = if *flip {
                ("/a/*rest", "/a/b")
            } else {
                ("/a/b", "/a/*rest")
            };
            reg.insert(route(first)).unwrap();
            let err = reg.insert(route(second)).unwrap_err();
            assert!(err.is_route_collision());
        }
    }

    #[test]
    fn catch_all_consumes_raw_remainder() {
        let reg = Registry::new();
        reg.insert(route("/files/*path")).unwrap();
        let hit = lookup(&reg, "/files/a%20b/c").unwrap();
        assert_eq!(hit.params[0].name, "path");
        assert_eq!(hit.params[0].raw, "a%20b/c");
        assert_eq!(hit.params[0].decoded, "a b/c");

        let hit = lookup(&reg, "/files").unwrap();
        assert_eq!(hit.params[0].decoded, "");
    }

    #[test]
    fn no_route_reports_normalised_path() {
        let reg = Registry::new();
        let err = lookup(&reg, "//nope///here/").unwrap_err();
        assert!(err.is_no_route());
        assert!(format!("{:?}", err).contains("/nope/here"));
    }

    #[test]
    fn removal_by_identity_is_idempotent() {
        let reg = Registry::new();
        let r = route("/a/b");
        reg.insert(r.clone()).unwrap();
        assert!(reg.remove(&r));
        assert!(!reg.remove(&r));
        assert!(lookup(&reg, "/a/b").is_err());
    }

    #[test]
    fn removal_by_identity_spares_a_different_occupant() {
        let reg = Registry::new();
        let first = route("/a");
        reg.insert(first.clone()).unwrap();
        assert!(reg.remove(&first));
        let second = route("/a");
        reg.insert(second.clone()).unwrap();
        assert!(!reg.remove(&first));
        assert!(lookup(&reg, "/a").is_ok());
    }

    #[test]
    fn removal_by_pattern_frees_the_shape() {
        let reg = Registry::new();
        reg.insert(route("/a/:x")).unwrap();
        let removed = reg.remove_pattern("/a/:whatever").unwrap();
        assert!(removed.is_some());
        reg.insert(route("/a/:y")).unwrap();
    }

    #[test]
    fn root_route_matches_root_only() {
        let reg = Registry::new();
        reg.insert(route("/")).unwrap();
        assert!(lookup(&reg, "/").is_ok());
        assert!(lookup(&reg, "///").is_ok());
        assert!(lookup(&reg, "/a").is_err());
    }

    #[test]
    fn decoded_segments_drive_matching() {
        let reg = Registry::new();
        reg.insert(route("/u/:id")).unwrap();
        let hit = lookup(&reg, "/u/John%20Doe").unwrap();
        assert_eq!(hit.params[0].decoded, "John Doe");
        assert_eq!(hit.params[0].raw, "John%20Doe");
    }
}
