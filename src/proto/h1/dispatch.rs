//! The exchange orchestrator.
//!
//! One task per connection drives every exchange on it: parse the
//! head, assemble the request, resolve a route and handler, run the
//! handler while pumping its request body in and its responses out,
//! recover from failures through the error-handler chain, and decide
//! whether the connection survives into the next exchange.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::FutureExt;
use futures_util::StreamExt;
use http::header::{HeaderMap, EXPECT};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::conn::{wants_keep_alive, Pipeline};
use super::encode::Encoder;
use super::io::{Buffered, Writer};
use super::parse;
use crate::body::{Body, Sender};
use crate::channel::{Channel, Shared as ChannelState, Submission};
use crate::common::drain;
use crate::error::{Error, Fault, Kind, Rejection, Result};
use crate::handler::Endpoint;
use crate::media;
use crate::proto::RequestHead;
use crate::recover::{self, Recovery};
use crate::request::Request;
use crate::response::Response;
use crate::route::{normalize, select};
use crate::server::ServerShared;

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type Ack = futures_channel::oneshot::Sender<Result<()>>;

/// Drives a connection until it closes.
pub(crate) async fn serve_connection<T>(io: T, shared: Arc<ServerShared>, watch: drain::Watch)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = shared.config.clone();
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = Buffered::new(read_half);
    let mut pipeline = Pipeline::new(Writer::new(write_half), config.response_timeout);

    let mut draining = false;
    let mut first = true;
    loop {
        let parsed = match read_head(&mut reader, &config, &watch, &mut draining, first).await
        {
            Ok(Some(head)) => Ok(head),
            Ok(None) => break,
            Err(err) => Err(err),
        };
        first = false;

        match run_exchange(parsed, &mut reader, &mut pipeline, &shared, draining).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                debug!("connection failed: {}", err);
                break;
            }
        }
    }
    pipeline.close_output().await;
}

/// Reads the next request head. `Ok(None)` means the connection is
/// done (clean EOF, drain, or keep-alive idle timeout).
async fn read_head<R>(
    reader: &mut Buffered<R>,
    config: &crate::ServerConfig,
    watch: &drain::Watch,
    draining: &mut bool,
    first: bool,
) -> Result<Option<RequestHead>>
where
    R: AsyncRead + Unpin,
{
    loop {
        reader.consume_leading_lines();
        if let Some(head) =
            parse::parse_head(reader.read_buf(), config.max_request_head_size)?
        {
            return Ok(Some(head));
        }

        let idle = reader.buffered() == 0;
        let read = tokio::time::timeout(config.head_timeout, reader.read_more());
        let n = if idle && !*draining {
            tokio::select! {
                res = read => match res {
                    Ok(io) => io.map_err(Error::new_io)?,
                    Err(_elapsed) => {
                        if first {
                            return Err(Error::new_head_timeout());
                        }
                        trace!("keep-alive connection idled out");
                        return Ok(None);
                    }
                },
                _ = watch.signaled() => {
                    trace!("draining; no further exchanges on this connection");
                    *draining = true;
                    return Ok(None);
                }
            }
        } else {
            match read.await {
                Ok(io) => io.map_err(Error::new_io)?,
                Err(_elapsed) => return Err(Error::new_head_timeout()),
            }
        };

        if n == 0 {
            return if reader.buffered() == 0 {
                Ok(None)
            } else {
                Err(Error::new_end_of_stream())
            };
        }
    }
}

/// Everything staged for the write arm of the exchange loop.
enum WriteJob {
    /// Flush an already-encoded interim head.
    Flush { ack: Option<Ack> },
    /// Stream the final response body, then complete it.
    Final {
        body: Option<Body>,
        encoder: Encoder,
        ack: Option<Ack>,
        keep_alive: bool,
        shutdown_after: bool,
    },
}

enum WriteOutcome {
    InterimDone,
    Progress,
    FinalDone { truncated: bool },
}

/// How one exchange left the connection.
struct FinalMeta {
    keep_alive: bool,
    shutdown_after: bool,
}

enum Pump {
    /// Demand arrived while a `100 Continue` is owed.
    SendContinue,
    Progress,
    /// The body is fully delivered or nobody wants it.
    Idle,
}

/// Runs one exchange. `Ok(keep_alive)`; `Err` forfeits the connection.
async fn run_exchange<R, W>(
    parsed: Result<RequestHead>,
    reader: &mut Buffered<R>,
    pipeline: &mut Pipeline<W>,
    shared: &Arc<ServerShared>,
    draining: bool,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = shared.config.clone();

    // The version responses are encoded with; defaults to 1.1 until a
    // head parses.
    let mut version = Version::HTTP_11;
    // What the peer actually speaks, as far as known; drives the
    // interim-protocol check and the upgrade-rejection shape.
    let mut client_version = Version::HTTP_11;
    let mut initial_error: Option<Error> = None;
    let mut request: Option<Request> = None;
    let mut endpoint: Option<Endpoint> = None;
    let mut body_tx: Option<Sender> = None;
    let mut body_remaining: u64 = 0;
    let mut expect_continue = false;
    let mut is_head = false;
    let mut is_connect = false;

    match parsed {
        Ok(head) => {
            version = head.version;
            client_version = head.version;
            is_head = head.method == Method::HEAD;
            is_connect = head.method == Method::CONNECT;

            if version == Version::HTTP_10 && config.reject_http_1_0 {
                initial_error = Some(Error::new_version_too_old("HTTP/1.1"));
            }

            let mut fail = |err: Error, slot: &mut Option<Error>| {
                if slot.is_none() {
                    *slot = Some(err);
                }
            };

            let body_len = match parse::body_length(&head.headers) {
                Ok(len) => len,
                Err(err) => {
                    fail(err, &mut initial_error);
                    0
                }
            };
            let target = match normalize::normalize(&head.target) {
                Ok(target) => Some(target),
                Err(err) => {
                    fail(err, &mut initial_error);
                    None
                }
            };

            let body = if body_len > 0 {
                let (tx, body) = Body::channel();
                body_tx = Some(tx);
                body_remaining = body_len;
                body
            } else {
                Body::empty()
            };
            expect_continue = body_len > 0
                && version >= Version::HTTP_11
                && head
                    .headers
                    .get(EXPECT)
                    .map(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
                    .unwrap_or(false);

            // The request is assembled before any routing so that
            // error handlers always see one once the head parsed.
            let looked_up = target.as_ref().and_then(|target| {
                match shared.registry.lookup(target) {
                    Ok(hit) => Some(hit),
                    Err(err) => {
                        fail(err, &mut initial_error);
                        None
                    }
                }
            });
            let params = looked_up
                .as_ref()
                .map(|hit| hit.params.clone())
                .unwrap_or_default();
            let query = target.map(|t| t.query).unwrap_or_default();

            let req = Request::new(
                head.method.clone(),
                head.target,
                version,
                head.headers,
                params,
                query,
                body,
            );

            if head.method == Method::TRACE && body_len > 0 {
                fail(
                    Error::new_illegal_body(Fault::Client, "TRACE request carried a body"),
                    &mut initial_error,
                );
            }

            if initial_error.is_none() {
                if let Some(hit) = looked_up {
                    let content_type = match media::parse_content_type(req.headers()) {
                        Ok(ct) => ct,
                        Err(err) => {
                            fail(err, &mut initial_error);
                            None
                        }
                    };
                    match media::parse_accept(req.headers()) {
                        Ok(accept) => {
                            if initial_error.is_none() {
                                match select::select(
                                    &hit.route,
                                    req.method(),
                                    content_type.as_ref(),
                                    &accept,
                                ) {
                                    Ok(chosen) => endpoint = Some(chosen),
                                    Err(err) => fail(err, &mut initial_error),
                                }
                            }
                        }
                        Err(err) => fail(err, &mut initial_error),
                    }
                }
            }

            request = Some(req);
        }
        Err(err) => {
            if matches!(err.kind(), Kind::VersionTooOld { .. }) {
                client_version = Version::HTTP_10;
            }
            initial_error = Some(err);
        }
    }

    let (channel, mut rx, chan_state) =
        Channel::new(client_version, config.ignore_rejected_interim);
    let attempts = Arc::new(AtomicU32::new(0));
    let ctx = Recovery::new(
        request.clone(),
        endpoint.clone(),
        channel.clone(),
        client_version,
    );

    let mut task_is_recovery = initial_error.is_some();
    let mut task: Option<TaskFuture> = Some(match initial_error {
        Some(err) => recovery_task(err, shared, ctx.clone(), attempts.clone()),
        None => {
            let endpoint = endpoint.as_ref().expect("selected without error");
            let request = request.clone().expect("assembled without error");
            handler_task(endpoint.handler().call(request, channel.clone()))
        }
    });

    let mut write: Option<WriteJob> = None;
    let mut final_meta: Option<FinalMeta> = None;
    let mut pending_error: Option<Error> = None;
    let mut handler_clean = false;
    let mut fatal: Option<Error> = None;
    let mut sent_continue = false;
    let mut force_close = false;
    let empty_headers = HeaderMap::new();

    while fatal.is_none() {
        if final_meta.is_some() && task.is_none() && write.is_none() {
            break;
        }

        // A finished task with nothing on the wire and nothing queued
        // left this exchange without a final response.
        if task.is_none() && write.is_none() && final_meta.is_none() {
            match rx.try_next() {
                Ok(Some(submission)) => {
                    stage_submission(
                        submission,
                        pipeline,
                        &chan_state,
                        version,
                        is_head,
                        is_connect,
                        request.as_ref().map(Request::headers).unwrap_or(&empty_headers),
                        &mut write,
                        &mut pending_error,
                    );
                    continue;
                }
                _ => {
                    let err = match pending_error.take() {
                        Some(err) => err,
                        None if handler_clean => {
                            Error::new_internal("handler completed without a response")
                        }
                        None => Error::new_internal("exchange stalled without a response"),
                    };
                    if pipeline.is_closed() {
                        fatal = Some(err);
                        break;
                    }
                    handler_clean = false;
                    task_is_recovery = true;
                    task = Some(recovery_task(err, shared, ctx.clone(), attempts.clone()));
                    continue;
                }
            }
        }

        tokio::select! {
            biased;

            submission = rx.next(), if write.is_none() => {
                if let Some(submission) = submission {
                    stage_submission(
                        submission,
                        pipeline,
                        &chan_state,
                        version,
                        is_head,
                        is_connect,
                        request.as_ref().map(Request::headers).unwrap_or(&empty_headers),
                        &mut write,
                        &mut pending_error,
                    );
                }
            }

            outcome = write_step(pipeline, write.as_mut().expect("write job present")), if write.is_some() => {
                match outcome {
                    Ok(WriteOutcome::Progress) => {}
                    Ok(WriteOutcome::InterimDone) => {
                        if let Some(WriteJob::Flush { ack }) = write.take() {
                            if let Some(ack) = ack {
                                let _ = ack.send(Ok(()));
                            }
                        }
                    }
                    Ok(WriteOutcome::FinalDone { truncated }) => {
                        if let Some(WriteJob::Final { ack, keep_alive, shutdown_after, encoder, .. }) = write.take() {
                            if let Some(ack) = ack {
                                let _ = ack.send(Ok(()));
                            }
                            if truncated || encoder.is_close_delimited() {
                                force_close = true;
                            }
                            final_meta = Some(FinalMeta {
                                keep_alive: keep_alive && !truncated,
                                shutdown_after,
                            });
                        }
                    }
                    Err(err) => {
                        if let Some(job) = write.take() {
                            let ack = match job {
                                WriteJob::Flush { ack } => ack,
                                WriteJob::Final { ack, .. } => ack,
                            };
                            if let Some(ack) = ack {
                                let _ = ack.send(Err(Error::new_rejected(Rejection::ChannelClosed)));
                            }
                        }
                        if pipeline.is_closed() {
                            fatal = Some(err);
                        } else if let Some(prev) = pending_error.take() {
                            pending_error = Some(err.with_suppressed(prev));
                        } else {
                            pending_error = Some(err);
                        }
                    }
                }
            }

            result = task.as_mut().expect("task present"), if task.is_some() => {
                task = None;
                match result {
                    Ok(()) => {
                        handler_clean = true;
                    }
                    Err(err) => {
                        if chan_state.saw_final() || final_meta.is_some() {
                            warn!("error after the final response was sent: {}", err);
                        } else if err.is_client_aborted() || pipeline.is_closed() {
                            fatal = Some(err);
                        } else if task_is_recovery {
                            fatal = Some(err);
                        } else {
                            let err = match pending_error.take() {
                                Some(prev) => err.with_suppressed(prev),
                                None => err,
                            };
                            task_is_recovery = true;
                            task = Some(recovery_task(err, shared, ctx.clone(), attempts.clone()));
                        }
                    }
                }
            }

            pumped = pump_body(
                reader,
                body_tx.as_mut().expect("body sender present"),
                &mut body_remaining,
                &config,
                expect_continue && !sent_continue,
            ), if body_tx.is_some() => {
                match pumped {
                    Ok(Pump::SendContinue) => {
                        sent_continue = true;
                        if write.is_none() && !chan_state.saw_final() && !pipeline.is_closed() {
                            let interim = Response::builder()
                                .status(StatusCode::CONTINUE)
                                .body(Body::empty())
                                .expect("valid interim response");
                            pipeline.stage_interim(&interim, version);
                            write = Some(WriteJob::Flush { ack: None });
                        }
                    }
                    Ok(Pump::Progress) => {}
                    Ok(Pump::Idle) => {
                        body_tx = None;
                    }
                    Err(err) => {
                        if let Some(tx) = body_tx.take() {
                            tx.abort();
                        }
                        if err.is_end_of_stream() || pipeline.is_closed() {
                            fatal = Some(err);
                        } else if task.is_none() && final_meta.is_none() {
                            task_is_recovery = true;
                            task = Some(recovery_task(err, shared, ctx.clone(), attempts.clone()));
                        } else if let Some(prev) = pending_error.take() {
                            pending_error = Some(err.with_suppressed(prev));
                        } else {
                            pending_error = Some(err);
                        }
                        force_close = true;
                    }
                }
            }
        }
    }

    if let Some(err) = fatal {
        if let Some(tx) = body_tx.take() {
            tx.abort();
        }
        chan_state.mark_closed();
        pipeline.close_output().await;
        return Err(err);
    }

    chan_state.mark_closed();
    let meta = final_meta.expect("final response before exchange end");

    if meta.shutdown_after {
        pipeline.close_output().await;
        return Ok(false);
    }
    if force_close || pipeline.is_closed() {
        return Ok(false);
    }

    // Whatever body bytes the exchange left unread are discarded so
    // the next head starts at a clean boundary.
    if let Some(tx) = body_tx.take() {
        drop(tx);
    }
    while body_remaining > 0 {
        if reader.buffered() == 0 {
            let read = tokio::time::timeout(config.body_timeout, reader.read_more());
            let n = match read.await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("failed discarding request body: {}", e);
                    return Ok(false);
                }
                Err(_elapsed) => {
                    debug!("timed out discarding request body");
                    return Ok(false);
                }
            };
            if n == 0 {
                return Ok(false);
            }
        }
        let n = std::cmp::min(reader.buffered() as u64, body_remaining) as usize;
        let _ = reader.take_buffered(n);
        body_remaining -= n as u64;
    }

    Ok(meta.keep_alive && !draining)
}

/// Validates a submission against the pipeline and stages its write.
fn stage_submission<W>(
    submission: Submission,
    pipeline: &mut Pipeline<W>,
    chan_state: &ChannelState,
    version: Version,
    is_head: bool,
    is_connect: bool,
    req_headers: &HeaderMap,
    write: &mut Option<WriteJob>,
    pending_error: &mut Option<Error>,
) where
    W: AsyncWrite + Unpin,
{
    let Submission { mut response, ack } = submission;

    if let Some(reason) = pipeline.rejection() {
        debug!("response {} rejected: {:?}", response.status(), reason);
        let _ = ack.send(Err(Error::new_rejected(reason)));
        return;
    }

    if response.is_interim() {
        pipeline.stage_interim(&response, version);
        *write = Some(WriteJob::Flush { ack: Some(ack) });
        return;
    }

    if (is_head || is_connect) && !response.body_known_empty() {
        let detail = "response to HEAD or CONNECT carried a body";
        let _ = ack.send(Err(Error::new_illegal_body(Fault::App, detail)));
        if pending_error.is_none() {
            *pending_error = Some(Error::new_illegal_body(Fault::App, detail));
        }
        return;
    }

    let close_delimited = !is_head && response.content_length().is_none();
    let mut keep_alive = wants_keep_alive(version, req_headers, &response, close_delimited);
    if is_connect && response.status().is_success() {
        // No tunnelling: a granted CONNECT still ends the connection.
        keep_alive = false;
    }

    chan_state.mark_final();
    let encoder = pipeline.begin_final(&response, version, is_head);
    let shutdown_after = response.must_shutdown_output_after_write();
    let body = response.take_body();
    trace!("final {} staged", response.status());
    *write = Some(WriteJob::Final {
        body: Some(body),
        encoder,
        ack: Some(ack),
        keep_alive,
        shutdown_after,
    });
}

/// One await-bounded step of the write arm.
async fn write_step<W>(pipeline: &mut Pipeline<W>, job: &mut WriteJob) -> Result<WriteOutcome>
where
    W: AsyncWrite + Unpin,
{
    match job {
        WriteJob::Flush { .. } => {
            pipeline.finish_interim().await?;
            Ok(WriteOutcome::InterimDone)
        }
        WriteJob::Final { body, encoder, .. } => {
            let next = match body.as_mut() {
                Some(streaming) => streaming.data().await,
                None => {
                    let truncated = pipeline.end_final(encoder).await?;
                    return Ok(WriteOutcome::FinalDone { truncated });
                }
            };
            match next {
                Some(Ok(chunk)) => {
                    pipeline.write_chunk(encoder, chunk).await?;
                    Ok(WriteOutcome::Progress)
                }
                Some(Err(err)) => Err(Error::new_user_body(err)),
                None => {
                    *body = None;
                    Ok(WriteOutcome::Progress)
                }
            }
        }
    }
}

/// Feeds request-body bytes towards the handler as it demands them.
async fn pump_body<R>(
    reader: &mut Buffered<R>,
    tx: &mut Sender,
    remaining: &mut u64,
    config: &crate::ServerConfig,
    want_continue: bool,
) -> Result<Pump>
where
    R: AsyncRead + Unpin,
{
    if *remaining == 0 {
        return Ok(Pump::Idle);
    }
    if tx.ready().await.is_err() {
        trace!("request body receiver gone; pump idle");
        return Ok(Pump::Idle);
    }
    if want_continue {
        return Ok(Pump::SendContinue);
    }

    if reader.buffered() == 0 {
        let read = tokio::time::timeout(config.body_timeout, reader.read_more());
        let n = match read.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::new_io(e)),
            Err(_elapsed) => return Err(Error::new_body_timeout()),
        };
        if n == 0 {
            return Err(Error::new_end_of_stream());
        }
    }

    let n = std::cmp::min(reader.buffered() as u64, *remaining) as usize;
    let chunk: Bytes = reader.take_buffered(n);
    *remaining -= chunk.len() as u64;
    let _ = tx.try_send_data(chunk);
    if *remaining == 0 {
        tx.finish();
        return Ok(Pump::Idle);
    }
    Ok(Pump::Progress)
}

fn handler_task(fut: crate::handler::HandlerFuture) -> TaskFuture {
    Box::pin(async move {
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::new_internal(panic_message(panic))),
        }
    })
}

fn recovery_task(
    err: Error,
    shared: &Arc<ServerShared>,
    ctx: Recovery,
    attempts: Arc<AtomicU32>,
) -> TaskFuture {
    let handlers = shared.error_handlers();
    let max = shared.config.max_error_recovery_attempts;
    Box::pin(async move {
        let fut = recover::run(err, handlers, ctx, max, attempts);
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(Error::new_internal(panic_message(panic))),
        }
    })
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_owned()
    }
}
