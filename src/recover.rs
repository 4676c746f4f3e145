//! Error recovery.
//!
//! Failed exchanges run through the application's error handlers in
//! registration order. A handler that resolves `Ok(())` has handled
//! the error (normally by writing a response through the channel). A
//! handler that returns the very same error value it was given opts
//! out, and the chain advances; returning a different error restarts
//! the cycle with it. Every invocation counts against the
//! per-exchange attempt cap, after which the default handler below
//! translates whatever error is current.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use http::header::{CONNECTION, UPGRADE};
use http::{StatusCode, Version};
use tracing::{debug, error, trace, warn};

use crate::body::Body;
use crate::channel::Channel;
use crate::error::{Error, Fault, Kind, Parse, Timeout};
use crate::handler::Endpoint;
use crate::request::Request;
use crate::response::Response;

/// The future type error handlers return.
pub type ErrorHandlerFuture =
    Pin<Box<dyn Future<Output = std::result::Result<(), Error>> + Send>>;

/// An application error handler.
///
/// Implemented for free by `Fn(Error, Recovery)` closures returning a
/// `Result<(), Error>` future.
pub trait ErrorHandler: Send + Sync + 'static {
    fn handle(&self, error: Error, recovery: Recovery) -> ErrorHandlerFuture;
}

impl<F, R> ErrorHandler for F
where
    F: Fn(Error, Recovery) -> R + Send + Sync + 'static,
    R: Future<Output = std::result::Result<(), Error>> + Send + 'static,
{
    fn handle(&self, error: Error, recovery: Recovery) -> ErrorHandlerFuture {
        Box::pin((self)(error, recovery))
    }
}

/// What an error handler has to work with.
#[derive(Clone)]
pub struct Recovery {
    request: Option<Request>,
    endpoint: Option<Endpoint>,
    channel: Channel,
    version: Version,
}

impl std::fmt::Debug for Recovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recovery")
            .field("request", &self.request)
            .field("has_handler", &self.endpoint.is_some())
            .finish()
    }
}

impl Recovery {
    pub(crate) fn new(
        request: Option<Request>,
        endpoint: Option<Endpoint>,
        channel: Channel,
        version: Version,
    ) -> Recovery {
        Recovery {
            request,
            endpoint,
            channel,
            version,
        }
    }

    /// The request, present whenever head parsing succeeded.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The write handle for this exchange.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// True when a handler had been selected before the failure.
    pub fn has_handler(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Invokes the originally selected handler again.
    pub async fn retry(&self) -> crate::Result<()> {
        match (&self.endpoint, &self.request) {
            (Some(endpoint), Some(request)) => {
                trace!("retrying request handler");
                endpoint
                    .handler()
                    .call(request.clone(), self.channel.clone())
                    .await
            }
            _ => Err(Error::new_internal("no handler available to retry")),
        }
    }
}

/// Runs the chain, then the default handler. `Ok(())` means a
/// response was produced (or deliberately withheld); `Err` closes the
/// connection.
pub(crate) async fn run(
    error: Error,
    handlers: Arc<[Arc<dyn ErrorHandler>]>,
    ctx: Recovery,
    max_attempts: u32,
    attempts: Arc<AtomicU32>,
) -> std::result::Result<(), Error> {
    if error.is_client_aborted() {
        return Err(error);
    }

    let mut current = error;
    'cycle: loop {
        for handler in handlers.iter() {
            if attempts.load(Ordering::Acquire) >= max_attempts {
                warn!("error recovery attempts exhausted");
                break 'cycle;
            }
            attempts.fetch_add(1, Ordering::AcqRel);
            let id = current.instance_id();
            match handler.handle(current, ctx.clone()).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    if returned.instance_id() == id {
                        // Opted out; same error moves down the chain.
                        current = returned;
                    } else {
                        debug!("error handler raised a new error: {}", returned);
                        current = returned;
                        continue 'cycle;
                    }
                }
            }
        }
        break;
    }

    default_translate(current, &ctx).await
}

/// The default, exhaustive error-to-response translation.
pub(crate) async fn default_translate(
    error: Error,
    ctx: &Recovery,
) -> std::result::Result<(), Error> {
    enum Plan {
        Respond {
            status: StatusCode,
            upgrade: bool,
            close: bool,
        },
        Close,
    }

    let app_fault = |has_handler: bool| {
        if has_handler {
            (StatusCode::INTERNAL_SERVER_ERROR, true)
        } else {
            (StatusCode::BAD_REQUEST, false)
        }
    };

    let plan = match error.kind() {
        Kind::Parse(Parse::Head) | Kind::Parse(Parse::Version) | Kind::Parse(Parse::Header) => {
            debug!("request rejected: {}", error);
            Plan::Respond {
                status: StatusCode::BAD_REQUEST,
                upgrade: false,
                close: true,
            }
        }
        Kind::VersionTooOld { .. } => {
            debug!("upgrade required: {}", error);
            Plan::Respond {
                status: StatusCode::UPGRADE_REQUIRED,
                upgrade: true,
                close: ctx.version < Version::HTTP_11,
            }
        }
        Kind::VersionTooNew => {
            debug!("version not supported: {}", error);
            Plan::Respond {
                status: StatusCode::HTTP_VERSION_NOT_SUPPORTED,
                upgrade: false,
                close: true,
            }
        }
        Kind::NoRouteFound { path } => {
            warn!("no route found for {}", path);
            Plan::Respond {
                status: StatusCode::NOT_FOUND,
                upgrade: false,
                close: false,
            }
        }
        Kind::Parse(Parse::TooLarge) => {
            warn!("request head too large");
            Plan::Respond {
                status: StatusCode::PAYLOAD_TOO_LARGE,
                upgrade: false,
                close: true,
            }
        }
        Kind::NoHandlerFound | Kind::AmbiguousHandler => {
            warn!("content negotiation failed: {}", error);
            Plan::Respond {
                status: StatusCode::NOT_IMPLEMENTED,
                upgrade: false,
                close: false,
            }
        }
        Kind::MediaTypeParse => {
            let (status, log) = app_fault(ctx.has_handler());
            if log {
                error!("media type fault after handler selection: {}", error);
            } else {
                debug!("unparsable media type from client: {}", error);
            }
            Plan::Respond {
                status,
                upgrade: false,
                close: false,
            }
        }
        Kind::IllegalBody(fault) => {
            let (status, log) = match fault {
                Fault::App => (StatusCode::INTERNAL_SERVER_ERROR, true),
                Fault::Client => (StatusCode::BAD_REQUEST, false),
            };
            if log {
                error!("illegal body from application: {}", error);
            } else {
                debug!("illegal body from client: {}", error);
            }
            Plan::Respond {
                status,
                upgrade: false,
                close: false,
            }
        }
        Kind::EndOfStream => {
            debug!("peer went away mid-message");
            Plan::Close
        }
        Kind::Rejected(_) => {
            warn!("response rejected during exchange: {}", error);
            Plan::Respond {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                upgrade: false,
                close: false,
            }
        }
        Kind::Timeout(Timeout::Head) | Kind::Timeout(Timeout::Body) => {
            debug!("request timed out: {}", error);
            Plan::Respond {
                status: StatusCode::REQUEST_TIMEOUT,
                upgrade: false,
                close: true,
            }
        }
        Kind::Timeout(Timeout::Response) => {
            warn!("response write timed out");
            Plan::Respond {
                status: StatusCode::SERVICE_UNAVAILABLE,
                upgrade: false,
                close: true,
            }
        }
        Kind::ClientAborted => Plan::Close,
        _ => {
            error!("unhandled error: {}", error);
            Plan::Respond {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                upgrade: false,
                close: false,
            }
        }
    };

    match plan {
        Plan::Close => Err(error),
        Plan::Respond {
            status,
            upgrade,
            close,
        } => {
            let mut builder = Response::builder().status(status);
            if upgrade {
                let token = match error.kind() {
                    Kind::VersionTooOld { upgrade } => *upgrade,
                    _ => "HTTP/1.1",
                };
                builder = builder.header(UPGRADE, token);
                if !close {
                    builder = builder.header(CONNECTION, "Upgrade");
                }
            }
            let response = builder
                .close_after_write(close)
                .body(Body::empty())
                .map_err(|e| e.with_suppressed(error))?;
            ctx.channel.send(response).await
        }
    }
}
