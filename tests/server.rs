#![deny(rust_2018_idioms)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use junction::{
    respond_with, Body, Channel, Endpoint, Error, Recovery, Request, Response, Route, Server,
    ServerConfig, StatusCode,
};

fn serve(config: Arc<ServerConfig>) -> (Server, SocketAddr) {
    let _ = pretty_env_logger::try_init();
    let server = Server::new(config);
    let addr = server.start(None).expect("server start");
    (server, addr)
}

fn serve_default() -> (Server, SocketAddr) {
    serve(ServerConfig::new().done())
}

fn connect(addr: &SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    stream
}

/// Reads bytes until the head-terminating blank line.
fn read_head_block(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read head");
        assert!(
            n > 0,
            "eof before end of head: {:?}",
            String::from_utf8_lossy(&head)
        );
        head.extend_from_slice(&byte);
    }
    String::from_utf8(head).expect("ascii head")
}

/// Reads one response head and, per its `Content-Length`, its body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let head = read_head_block(stream);
    let len = content_length_of(&head);
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).expect("read body");
    (head, body)
}

fn content_length_of(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let mut parts = line.splitn(2, ':');
            match (parts.next(), parts.next()) {
                (Some(name), Some(value)) if name.eq_ignore_ascii_case("content-length") => {
                    value.trim().parse().ok()
                }
                _ => None,
            }
        })
        .unwrap_or(0)
}

fn has_header(head: &str, name: &str, value: &str) -> bool {
    head.lines().any(|line| {
        let mut parts = line.splitn(2, ':');
        match (parts.next(), parts.next()) {
            (Some(n), Some(v)) => {
                n.eq_ignore_ascii_case(name) && v.trim().eq_ignore_ascii_case(value)
            }
            _ => false,
        }
    })
}

fn hello_route() -> Route {
    Route::builder("/hello")
        .unwrap()
        .endpoint(
            Endpoint::get(respond_with(|_req: Request| async move {
                Response::builder()
                    .header("content-type", "text/plain; charset=utf-8")
                    .body("Hello World!")
            }))
            .produces("text/plain; charset=utf-8".parse().unwrap()),
        )
        .unwrap()
        .build()
        .unwrap()
}

#[test]
fn greeting() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nAccept: text/plain\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{}", head);
    assert!(has_header(&head, "content-type", "text/plain; charset=utf-8"));
    assert_eq!(content_length_of(&head), 12);
    assert_eq!(&body[..], b"Hello World!");
}

#[test]
fn path_parameter() {
    let (server, addr) = serve_default();
    let route = Route::builder("/hello/:name")
        .unwrap()
        .endpoint(Endpoint::get(respond_with(|req: Request| async move {
            let name = req.param("name").expect("bound param").to_owned();
            Response::builder()
                .header("content-type", "text/plain; charset=utf-8")
                .body(format!("Hello {}!", name))
        })))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"GET /hello/John HTTP/1.1\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(content_length_of(&head), 11);
    assert_eq!(&body[..], b"Hello John!");
}

#[test]
fn percent_encoded_parameter_round_trip() {
    let (server, addr) = serve_default();
    let route = Route::builder("/u/:id")
        .unwrap()
        .endpoint(Endpoint::get(respond_with(|req: Request| async move {
            assert_eq!(req.param("id"), Some("John Doe"));
            assert_eq!(req.param_raw("id"), Some("John%20Doe"));
            Response::builder().body(Body::empty())
        })))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"GET /u/John%20Doe HTTP/1.1\r\n\r\n")
        .unwrap();
    let (head, _body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
}

#[test]
fn retry_on_error() {
    let (server, addr) = serve_default();
    let attempts = Arc::new(AtomicU32::new(0));
    let route = Route::builder("/")
        .unwrap()
        .endpoint(Endpoint::get(respond_with(move |_req: Request| {
            let attempts = attempts.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    return Err(Error::app("first attempt fails"));
                }
                Response::builder()
                    .status(StatusCode::NO_CONTENT)
                    .header("n", n.to_string())
                    .body(Body::empty())
            }
        })))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();
    server.add_error_handler(|_err: Error, recovery: Recovery| async move {
        recovery.retry().await
    });

    let mut stream = connect(&addr);
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    let (head, _body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 204"), "{}", head);
    assert!(has_header(&head, "n", "2"));
}

#[test]
fn upgrade_required_for_ancient_version() {
    let (_server, addr) = serve_default();

    let mut stream = connect(&addr);
    stream.write_all(b"GET / HTTP/0.9\r\n\r\n").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let head = String::from_utf8_lossy(&all);
    assert!(head.starts_with("HTTP/1.1 426"), "{}", head);
    assert!(has_header(&head, "upgrade", "HTTP/1.1"));
    assert!(has_header(&head, "connection", "close"));
    assert_eq!(content_length_of(&head), 0);
}

#[test]
fn http_version_too_new_is_505() {
    let (_server, addr) = serve_default();

    let mut stream = connect(&addr);
    stream.write_all(b"GET / HTTP/2.0\r\n\r\n").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let head = String::from_utf8_lossy(&all);
    assert!(head.starts_with("HTTP/1.1 505"), "{}", head);
}

#[test]
fn head_too_large_is_413_and_closes() {
    let (_server, addr) = serve(ServerConfig::new().max_request_head_size(1).done());

    let mut stream = connect(&addr);
    stream.write_all(b"AB").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let head = String::from_utf8_lossy(&all);
    assert!(head.starts_with("HTTP/1.1 413"), "{}", head);
    assert!(has_header(&head, "connection", "close"));
}

#[test]
fn interim_responses_precede_the_final_one() {
    let (server, addr) = serve_default();
    let route = Route::builder("/slow")
        .unwrap()
        .endpoint(Endpoint::get(
            |_req: Request, channel: Channel| async move {
                for _ in 0..2 {
                    let interim = Response::builder()
                        .status(StatusCode::PROCESSING)
                        .body(Body::empty())?;
                    channel.send(interim).await?;
                }
                let done = Response::builder().body("Done!")?;
                channel.send(done).await
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /slow HTTP/1.1\r\n\r\n").unwrap();

    let (first, _) = read_response(&mut stream);
    assert!(first.starts_with("HTTP/1.1 102"), "{}", first);
    let (second, _) = read_response(&mut stream);
    assert!(second.starts_with("HTTP/1.1 102"), "{}", second);
    let (last, body) = read_response(&mut stream);
    assert!(last.starts_with("HTTP/1.1 200"), "{}", last);
    assert_eq!(&body[..], b"Done!");
}

#[test]
fn interim_is_dropped_for_http_1_0_peers() {
    let (server, addr) = serve_default();
    let route = Route::builder("/slow")
        .unwrap()
        .endpoint(Endpoint::get(
            |_req: Request, channel: Channel| async move {
                let interim = Response::builder()
                    .status(StatusCode::PROCESSING)
                    .body(Body::empty())?;
                channel.send(interim).await?;
                channel.send(Response::builder().body("ok")?).await
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /slow HTTP/1.0\r\n\r\n").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.0 200"), "{}", text);
    assert!(!text.contains("102"));
}

#[test]
fn not_found_is_404() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"GET /nowhere HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"), "{}", head);
}

#[test]
fn unnegotiable_method_is_501() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"POST /hello HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 501"), "{}", head);
}

#[test]
fn echo_reads_the_request_body() {
    let (server, addr) = serve_default();
    let route = Route::builder("/echo")
        .unwrap()
        .endpoint(Endpoint::post(
            |req: Request, channel: Channel| async move {
                let body = req.take_body().expect("first taker");
                let bytes = junction::body::to_bytes(body).await?;
                let response = Response::builder().body(bytes.to_vec())?;
                channel.send(response).await
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Length: 12\r\n\r\nHello World!")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(&body[..], b"Hello World!");
}

#[test]
fn expect_continue_gets_an_automatic_interim() {
    let (server, addr) = serve_default();
    let route = Route::builder("/upload")
        .unwrap()
        .endpoint(Endpoint::post(
            |req: Request, channel: Channel| async move {
                let body = req.take_body().expect("first taker");
                let bytes = junction::body::to_bytes(body).await?;
                let response = Response::builder().body(bytes.to_vec())?;
                channel.send(response).await
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\nok",
        )
        .unwrap();
    let (first, _) = read_response(&mut stream);
    assert!(first.starts_with("HTTP/1.1 100"), "{}", first);
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(&body[..], b"ok");
}

#[test]
fn keep_alive_carries_multiple_exchanges() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    for _ in 0..3 {
        stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
        assert_eq!(&body[..], b"Hello World!");
    }
}

#[test]
fn connection_close_is_honoured() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
    assert!(text.ends_with("Hello World!"), "{}", text);
}

#[test]
fn http_1_0_closes_by_default() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /hello HTTP/1.0\r\n\r\n").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.0 200"), "{}", text);
}

#[test]
fn rejecting_http_1_0_yields_426() {
    let (_server, addr) = serve(ServerConfig::new().reject_http_1_0(true).done());

    let mut stream = connect(&addr);
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").unwrap();
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.0 426"), "{}", text);
    assert!(has_header(&text, "connection", "close"));
}

#[test]
fn trace_with_body_is_rejected() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream
        .write_all(b"TRACE /hello HTTP/1.1\r\nContent-Length: 2\r\n\r\nxx")
        .unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "{}", head);
}

#[test]
fn head_response_with_body_becomes_500() {
    let (server, addr) = serve_default();
    let route = Route::builder("/peek")
        .unwrap()
        .endpoint(Endpoint::head(respond_with(|_req: Request| async move {
            // A HEAD response must not carry payload bytes.
            Response::builder().body("secret payload")
        })))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"HEAD /peek HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 500"), "{}", head);
    assert!(body.is_empty());
}

#[test]
fn truncated_response_body_forfeits_the_connection() {
    let (server, addr) = serve_default();
    let route = Route::builder("/short")
        .unwrap()
        .endpoint(Endpoint::get(respond_with(|_req: Request| async move {
            // Promises five bytes, delivers none.
            Response::builder()
                .header("content-length", "5")
                .body(Body::empty())
        })))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /short HTTP/1.1\r\n\r\n").unwrap();
    let head = read_head_block(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(content_length_of(&head), 5);

    // The producer came up short; the connection is closed instead of
    // the missing bytes being papered over.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty(), "unexpected body bytes: {:?}", rest);
}

#[test]
fn handler_without_response_becomes_500() {
    let (server, addr) = serve_default();
    let route = Route::builder("/mute")
        .unwrap()
        .endpoint(Endpoint::get(|_req: Request, _channel: Channel| async move {
            Ok(())
        }))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /mute HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 500"), "{}", head);
}

#[test]
fn second_final_response_is_rejected() {
    let (server, addr) = serve_default();
    let route = Route::builder("/twice")
        .unwrap()
        .endpoint(Endpoint::get(
            |_req: Request, channel: Channel| async move {
                channel.send(Response::builder().body("first")?).await?;
                let err = channel
                    .send(Response::builder().body("second")?)
                    .await
                    .expect_err("second final must be rejected");
                assert_eq!(
                    err.rejection(),
                    Some(junction::Rejection::AlreadyFinal)
                );
                Ok(())
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /twice HTTP/1.1\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);
    assert_eq!(&body[..], b"first");
}

#[test]
fn streamed_response_body_arrives() {
    let (server, addr) = serve_default();
    let route = Route::builder("/stream")
        .unwrap()
        .endpoint(Endpoint::get(
            |_req: Request, channel: Channel| async move {
                let (mut tx, body) = Body::channel();
                let response = Response::builder().body(body)?;
                let send = channel.send(response);
                let feed = async move {
                    for chunk in &[&b"one "[..], &b"two "[..], &b"three"[..]] {
                        tx.send_data(bytes::Bytes::from_static(chunk)).await?;
                    }
                    tx.finish();
                    Ok::<_, Error>(())
                };
                let (sent, fed) = futures_util::join!(send, feed);
                fed?;
                sent
            },
        ))
        .unwrap()
        .build()
        .unwrap();
    server.add(route).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /stream HTTP/1.1\r\n\r\n").unwrap();
    // Unknown length: the body is close-delimited.
    let mut all = Vec::new();
    stream.read_to_end(&mut all).unwrap();
    let text = String::from_utf8_lossy(&all);
    assert!(text.starts_with("HTTP/1.1 200"), "{}", text);
    assert!(has_header(&text, "connection", "close"));
    assert!(text.ends_with("one two three"), "{}", text);
}

#[test]
fn graceful_stop_drains() {
    let (server, addr) = serve_default();
    server.add(hello_route()).unwrap();

    let mut stream = connect(&addr);
    stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{}", head);

    server.stop().wait();

    // New connections are refused (or immediately closed) once the
    // listener is gone.
    match TcpStream::connect(addr) {
        Err(_refused) => {}
        Ok(mut late) => {
            late.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let n = late.read(&mut [0u8; 1]).unwrap_or(0);
            assert_eq!(n, 0, "listener still serving after stop");
        }
    }
}
