//! Handlers and their registration metadata.
//!
//! A handler is a plain async callable over `(Request, Channel)`. The
//! registration side wraps it in an [`Endpoint`] carrying the request
//! method it answers, the content types it consumes, and the media
//! types it can produce, which together form the key the selector
//! negotiates on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use http::Method;
use mime::Mime;

use crate::channel::Channel;
use crate::error::Result;
use crate::media;
use crate::request::Request;
use crate::response::Response;

/// The future type handlers return.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// An application request handler.
///
/// Implemented for free by any `Fn(Request, Channel)` closure
/// returning a `Result<()>` future; see [`respond_with`] for the
/// common "return one response" shape.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: Request, channel: Channel) -> HandlerFuture;
}

impl<F, R> Handler for F
where
    F: Fn(Request, Channel) -> R + Send + Sync + 'static,
    R: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, request: Request, channel: Channel) -> HandlerFuture {
        Box::pin((self)(request, channel))
    }
}

/// Adapts a `Fn(Request) -> Future<Result<Response>>` closure into a
/// [`Handler`] that sends the returned response as the final one.
pub fn respond_with<F, R>(f: F) -> RespondWith<F>
where
    F: Fn(Request) -> R + Clone + Send + Sync + 'static,
    R: Future<Output = Result<Response>> + Send + 'static,
{
    RespondWith { f }
}

/// See [`respond_with`].
#[derive(Clone)]
pub struct RespondWith<F> {
    f: F,
}

impl<F> std::fmt::Debug for RespondWith<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespondWith").finish()
    }
}

impl<F, R> Handler for RespondWith<F>
where
    F: Fn(Request) -> R + Clone + Send + Sync + 'static,
    R: Future<Output = Result<Response>> + Send + 'static,
{
    fn call(&self, request: Request, channel: Channel) -> HandlerFuture {
        let f = self.f.clone();
        Box::pin(async move {
            let response = f(request).await?;
            channel.send(response).await
        })
    }
}

/// What request content types a handler accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Consumes {
    /// Requests with any content type, and requests without one.
    NothingAndAll,
    /// Only requests without a content type.
    Nothing,
    /// Requests whose content type the range covers.
    Of(Mime),
}

impl Consumes {
    pub(crate) fn accepts(&self, content_type: Option<&Mime>) -> bool {
        match self {
            Consumes::NothingAndAll => true,
            Consumes::Nothing => content_type.is_none(),
            Consumes::Of(range) => match content_type {
                Some(ct) => media::covers(range, ct),
                None => false,
            },
        }
    }
}

/// One registered handler on a route.
#[derive(Clone)]
pub struct Endpoint {
    method: Method,
    consumes: Consumes,
    produces: Vec<Mime>,
    handler: Arc<dyn Handler>,
}

impl Endpoint {
    pub fn new<H: Handler>(method: Method, handler: H) -> Endpoint {
        Endpoint {
            method,
            consumes: Consumes::NothingAndAll,
            produces: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn get<H: Handler>(handler: H) -> Endpoint {
        Endpoint::new(Method::GET, handler)
    }

    pub fn post<H: Handler>(handler: H) -> Endpoint {
        Endpoint::new(Method::POST, handler)
    }

    pub fn put<H: Handler>(handler: H) -> Endpoint {
        Endpoint::new(Method::PUT, handler)
    }

    pub fn delete<H: Handler>(handler: H) -> Endpoint {
        Endpoint::new(Method::DELETE, handler)
    }

    pub fn head<H: Handler>(handler: H) -> Endpoint {
        Endpoint::new(Method::HEAD, handler)
    }

    /// Restricts the request content types this handler accepts.
    pub fn consumes(mut self, consumes: Consumes) -> Endpoint {
        self.consumes = consumes;
        self
    }

    /// Adds a media type this handler can produce. Registering none
    /// is the same as producing `*/*`.
    pub fn produces(mut self, mime: Mime) -> Endpoint {
        self.produces.push(mime);
        self
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn consumes_pred(&self) -> &Consumes {
        &self.consumes
    }

    /// Declared produced types; empty means "produces `*/*`".
    pub(crate) fn produced(&self) -> &[Mime] {
        &self.produces
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }

    /// Two endpoints collide when their negotiation keys are equal.
    pub(crate) fn collides_with(&self, other: &Endpoint) -> bool {
        if self.method != other.method || self.consumes != other.consumes {
            return false;
        }
        let star = [mime::STAR_STAR];
        let mine = if self.produces.is_empty() {
            &star[..]
        } else {
            &self.produces[..]
        };
        let theirs = if other.produces.is_empty() {
            &star[..]
        } else {
            &other.produces[..]
        };
        let mut a: Vec<&str> = mine.iter().map(|m| m.as_ref()).collect();
        let mut b: Vec<&str> = theirs.iter().map(|m| m.as_ref()).collect();
        a.sort_unstable();
        b.sort_unstable();
        a == b
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("method", &self.method)
            .field("consumes", &self.consumes)
            .field("produces", &self.produces)
            .finish()
    }
}
