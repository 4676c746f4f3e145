#![deny(rust_2018_idioms)]

use junction::{respond_with, Endpoint, Request, Response, Route, Server, ServerConfig};

fn ok_endpoint() -> Endpoint {
    Endpoint::get(respond_with(|_req: Request| async move {
        Response::builder().body("ok")
    }))
}

fn route(pattern: &str) -> Route {
    Route::builder(pattern)
        .unwrap()
        .endpoint(ok_endpoint())
        .unwrap()
        .build()
        .unwrap()
}

fn server() -> Server {
    Server::new(ServerConfig::new().done())
}

#[test]
fn pattern_validation() {
    assert!(Route::builder("/a/:p/*rest").is_ok());
    assert!(Route::builder("no-slash").is_err());
    assert!(Route::builder("/a/*rest/b").is_err());
    assert!(Route::builder("/:x/:x").is_err());
    assert!(Route::builder("/:").is_err());
}

#[test]
fn handler_collisions_are_refused_at_build() {
    let err = Route::builder("/x")
        .unwrap()
        .endpoint(ok_endpoint())
        .unwrap()
        .endpoint(ok_endpoint())
        .unwrap_err();
    assert!(err.is_user());
}

#[test]
fn shape_collisions_are_order_independent() {
    for flip in &[false, true] {
        let server = server();
        let (first, second) = if *flip {
            ("/a/:y", "/a/:x")
        } else {
            ("/a/:x", "/a/:y")
        };
        server.add(route(first)).unwrap();
        let err = server.add(route(second)).unwrap_err();
        assert!(err.is_route_collision());
    }
}

#[test]
fn catch_all_claims_its_level() {
    for flip in &[false, true] {
        let server = server();
        let (first, second) = if *flip {
            ("/files/*rest", "/files/static")
        } else {
            ("/files/static", "/files/*rest")
        };
        server.add(route(first)).unwrap();
        let err = server.add(route(second)).unwrap_err();
        assert!(err.is_route_collision());
    }
}

#[test]
fn different_depths_do_not_collide() {
    let server = server();
    server.add(route("/a")).unwrap();
    server.add(route("/a/:p")).unwrap();
    server.add(route("/a/:p/c")).unwrap();
}

#[test]
fn removal_by_identity_is_idempotent() {
    let server = server();
    let r = route("/gone");
    server.add(r.clone()).unwrap();
    assert!(server.remove_route(&r));
    assert!(!server.remove_route(&r));

    // The shape is free again.
    server.add(route("/gone")).unwrap();
}

#[test]
fn removal_by_identity_requires_the_same_route() {
    let server = server();
    let original = route("/spot");
    server.add(original.clone()).unwrap();
    assert!(server.remove_route(&original));

    let replacement = route("/spot");
    server.add(replacement).unwrap();
    assert!(!server.remove_route(&original));
}

#[test]
fn removal_by_pattern_ignores_param_names() {
    let server = server();
    server.add(route("/v/:x")).unwrap();
    let removed = server.remove("/v/:anything").unwrap();
    assert!(removed.is_some());
    assert_eq!(removed.unwrap().pattern(), "/v/:x");
    assert!(server.remove("/v/:again").unwrap().is_none());
}
