//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result type often returned from methods that can have junction `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Represents errors that can occur handling HTTP exchanges.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    /// Errors superseded by this one during recovery, newest last.
    suppressed: Vec<Error>,
    /// Creation ticket; lets the recovery chain tell "rethrew the same
    /// error" apart from "threw an equal-looking new one".
    instance: u64,
}

#[derive(Debug)]
pub(crate) enum Kind {
    Parse(Parse),
    /// Request used an HTTP version below what the server speaks.
    VersionTooOld { upgrade: &'static str },
    /// Request used an HTTP version above what the server speaks.
    VersionTooNew,
    /// No route matched the normalised request path.
    NoRouteFound { path: String },
    /// A route matched, but no handler survived content negotiation.
    NoHandlerFound,
    /// More than one handler remained at the top negotiation rank.
    AmbiguousHandler,
    MediaTypeParse,
    /// A body where the protocol forbids one.
    IllegalBody(Fault),
    /// A route with this segment signature is already registered.
    RouteCollision,
    /// A response submission the pipeline refused.
    Rejected(Rejection),
    Timeout(Timeout),
    /// The peer closed its sending half mid-message.
    EndOfStream,
    /// The peer went away; no response will be attempted.
    ClientAborted,
    /// Indicates a body channel is closed.
    ChannelClosed,
    /// An `io::Error` while reading or writing the connection.
    Io,
    /// Error creating the server listener.
    Listen,
    User(User),
    /// A failure with no more specific classification.
    Internal,
}

#[derive(Debug)]
pub(crate) enum Parse {
    /// Malformed request line.
    Head,
    /// Malformed or unsupported version token.
    Version,
    /// Malformed header name or value.
    Header,
    /// The head exceeded the configured size cap.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timeout {
    Head,
    Body,
    Response,
}

/// Who is at fault for an illegal body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// The client sent one (e.g. a TRACE request body).
    Client,
    /// The application attached one (e.g. a HEAD response body).
    App,
}

/// Why the response pipeline refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The exchange's final response was already accepted.
    AlreadyFinal,
    /// The exchange is over or the connection output is gone.
    ChannelClosed,
    /// An interim response on a protocol version without them.
    ProtocolNotSupported,
}

#[derive(Debug)]
pub(crate) enum User {
    /// Malformed route pattern given to the route builder.
    RoutePattern,
    /// Two handlers on one route share (method, consumes, produces).
    HandlerCollision,
    /// Response builder invariant violation.
    Response,
    /// Error returned from an application handler.
    Service,
    /// Error polling an application body stream.
    Body,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
                instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// Returns true if `other` is the very same error value, as opposed
    /// to a second error of the same kind.
    pub fn is_same_instance(&self, other: &Error) -> bool {
        self.inner.instance == other.inner.instance
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.inner.instance
    }

    pub(crate) fn push_suppressed(&mut self, err: Error) {
        self.inner.suppressed.push(err);
    }

    /// Attaches a superseded error to this one, preserving the
    /// recovery trail. Returns `self` for chaining.
    pub fn with_suppressed(mut self, superseded: Error) -> Error {
        self.push_suppressed(superseded);
        self
    }

    /// Errors that were superseded by this one during recovery.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    /// Returns true if this was an HTTP head parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if the request head exceeded the configured cap.
    pub fn is_head_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if this error was caused by a deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(_))
    }

    /// Returns true if no route matched the request path.
    pub fn is_no_route(&self) -> bool {
        matches!(self.inner.kind, Kind::NoRouteFound { .. })
    }

    /// Returns true if content negotiation left no usable handler.
    pub fn is_no_handler(&self) -> bool {
        matches!(self.inner.kind, Kind::NoHandlerFound)
    }

    /// Returns true if content negotiation tied between handlers.
    pub fn is_ambiguous_handler(&self) -> bool {
        matches!(self.inner.kind, Kind::AmbiguousHandler)
    }

    /// Returns true if a message carried a body the protocol forbids.
    pub fn is_illegal_body(&self) -> bool {
        matches!(self.inner.kind, Kind::IllegalBody(_))
    }

    /// Returns true if inserting the route would collide with one
    /// already registered.
    pub fn is_route_collision(&self) -> bool {
        matches!(self.inner.kind, Kind::RouteCollision)
    }

    /// The pipeline's reason for refusing a response, if that is what
    /// this error is.
    pub fn rejection(&self) -> Option<Rejection> {
        match self.inner.kind {
            Kind::Rejected(reason) => Some(reason),
            _ => None,
        }
    }

    /// Returns true if the peer closed the connection mid-message.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::EndOfStream)
    }

    /// Returns true if the peer disappeared before a response could be
    /// attempted.
    pub fn is_client_aborted(&self) -> bool {
        matches!(self.inner.kind, Kind::ClientAborted)
    }

    /// Returns true if a body channel is closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::ChannelClosed)
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Consumes the error, returning its cause.
    pub fn into_cause(self) -> Option<Box<dyn StdError + Send + Sync>> {
        self.inner.cause
    }

    /// Wraps an application failure, for returning out of a handler
    /// or error handler.
    pub fn app<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Service)).with(cause)
    }

    // ===== constructors, grouped by origin =====

    pub(crate) fn new_head_parse() -> Error {
        Error::new(Kind::Parse(Parse::Head))
    }

    pub(crate) fn new_version_parse() -> Error {
        Error::new(Kind::Parse(Parse::Version))
    }

    pub(crate) fn new_bad_header() -> Error {
        Error::new(Kind::Parse(Parse::Header))
    }

    pub(crate) fn new_too_large() -> Error {
        Error::new(Kind::Parse(Parse::TooLarge))
    }

    pub(crate) fn new_version_too_old(upgrade: &'static str) -> Error {
        Error::new(Kind::VersionTooOld { upgrade })
    }

    pub(crate) fn new_version_too_new() -> Error {
        Error::new(Kind::VersionTooNew)
    }

    pub(crate) fn new_no_route(path: String) -> Error {
        Error::new(Kind::NoRouteFound { path })
    }

    pub(crate) fn new_no_handler() -> Error {
        Error::new(Kind::NoHandlerFound)
    }

    pub(crate) fn new_ambiguous_handler() -> Error {
        Error::new(Kind::AmbiguousHandler)
    }

    pub(crate) fn new_media_type<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::MediaTypeParse).with(cause)
    }

    pub(crate) fn new_illegal_body(fault: Fault, detail: &'static str) -> Error {
        Error::new(Kind::IllegalBody(fault)).with(detail)
    }

    pub(crate) fn new_route_collision() -> Error {
        Error::new(Kind::RouteCollision)
    }

    pub(crate) fn new_rejected(reason: Rejection) -> Error {
        Error::new(Kind::Rejected(reason))
    }

    pub(crate) fn new_head_timeout() -> Error {
        Error::new(Kind::Timeout(Timeout::Head))
    }

    pub(crate) fn new_body_timeout() -> Error {
        Error::new(Kind::Timeout(Timeout::Body))
    }

    pub(crate) fn new_response_timeout() -> Error {
        Error::new(Kind::Timeout(Timeout::Response))
    }

    pub(crate) fn new_end_of_stream() -> Error {
        Error::new(Kind::EndOfStream)
    }

    pub(crate) fn new_client_aborted() -> Error {
        Error::new(Kind::ClientAborted)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::ChannelClosed)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen(cause: std::io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_user_route_pattern(detail: String) -> Error {
        Error::new(Kind::User(User::RoutePattern)).with(detail)
    }

    pub(crate) fn new_user_handler_collision() -> Error {
        Error::new(Kind::User(User::HandlerCollision))
    }

    pub(crate) fn new_user_response(detail: &'static str) -> Error {
        Error::new(Kind::User(User::Response)).with(detail)
    }

    pub(crate) fn new_user_body<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Body)).with(cause)
    }

    pub(crate) fn new_internal<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Internal).with(cause)
    }

    /// The error's standalone message, without the message from the
    /// source.
    pub fn message(&self) -> impl fmt::Display + '_ {
        self.description()
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Head) => "invalid HTTP request line",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::VersionTooOld { .. } => "HTTP version too old",
            Kind::VersionTooNew => "HTTP version not supported",
            Kind::NoRouteFound { .. } => "no route matched the request path",
            Kind::NoHandlerFound => "no handler accepted the request",
            Kind::AmbiguousHandler => "multiple handlers tied for the request",
            Kind::MediaTypeParse => "invalid media type",
            Kind::IllegalBody(Fault::Client) => "request carried a forbidden body",
            Kind::IllegalBody(Fault::App) => "response carried a forbidden body",
            Kind::RouteCollision => "route already registered",
            Kind::Rejected(Rejection::AlreadyFinal) => {
                "response rejected: final response already sent"
            }
            Kind::Rejected(Rejection::ChannelClosed) => {
                "response rejected: exchange channel closed"
            }
            Kind::Rejected(Rejection::ProtocolNotSupported) => {
                "response rejected: not supported by the client's HTTP version"
            }
            Kind::Timeout(Timeout::Head) => "read of request head timed out",
            Kind::Timeout(Timeout::Body) => "read of request body timed out",
            Kind::Timeout(Timeout::Response) => "write of response timed out",
            Kind::EndOfStream => "connection closed before message completed",
            Kind::ClientAborted => "client aborted the exchange",
            Kind::ChannelClosed => "channel closed",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::User(User::RoutePattern) => "invalid route pattern",
            Kind::User(User::HandlerCollision) => {
                "handler with equal method and media types already present"
            }
            Kind::User(User::Response) => "invalid response",
            Kind::User(User::Service) => "error from application handler",
            Kind::User(User::Body) => "error from application body stream",
            Kind::Internal => "internal error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("junction::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        if !self.inner.suppressed.is_empty() {
            f.field(&self.inner.suppressed);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Error {
        match err {
            httparse::Error::HeaderName | httparse::Error::HeaderValue => {
                Error::new_bad_header()
            }
            httparse::Error::TooManyHeaders => Error::new_too_large(),
            httparse::Error::Version => Error::new_version_parse(),
            _ => Error::new_head_parse(),
        }
    }
}

#[doc(hidden)]
trait AssertSendSync: Send + Sync + 'static {}
#[doc(hidden)]
impl AssertSendSync for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_identity_distinguishes_equal_kinds() {
        let a = Error::new_no_handler();
        let b = Error::new_no_handler();
        assert!(a.is_same_instance(&a));
        assert!(!a.is_same_instance(&b));
    }

    #[test]
    fn suppressed_trail_is_kept_in_order() {
        let mut latest = Error::new_no_handler();
        latest.push_suppressed(Error::new_no_route("/a".into()));
        latest.push_suppressed(Error::new_bad_header());
        let trail = latest.suppressed();
        assert_eq!(trail.len(), 2);
        assert!(trail[0].is_no_route());
        assert!(trail[1].is_parse());
    }
}
