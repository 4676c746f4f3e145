#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # junction
//!
//! junction is a small and correct HTTP/1.x server library.
//!
//! Routes are registered on a [`Server`] as patterns with positional
//! (`:name`) and trailing catch-all (`*rest`) parameters, each
//! carrying one or more handlers keyed by request method and media
//! types. Handlers are plain async callables: they receive the
//! immutable [`Request`] and a [`Channel`] to write any number of
//! interim (1xx) responses followed by one final response. Failures
//! anywhere in an exchange run through an application-supplied error
//! handler chain before a default policy turns them into responses.
//!
//! ```no_run
//! use junction::{respond_with, Endpoint, Response, Route, Server, ServerConfig};
//!
//! let server = Server::new(ServerConfig::new().done());
//! let hello = Route::builder("/hello/:name").unwrap()
//!     .endpoint(Endpoint::get(respond_with(|req: junction::Request| async move {
//!         let name = req.param("name").unwrap_or("world").to_owned();
//!         Response::builder()
//!             .header("content-type", "text/plain; charset=utf-8")
//!             .body(format!("Hello {}!", name))
//!     })))
//!     .unwrap()
//!     .build()
//!     .unwrap();
//! server.add(hello).unwrap();
//! let addr = server.start(None).unwrap();
//! println!("listening on {}", addr);
//! ```
//!
//! The server runs every connection on one process-wide worker pool,
//! created when the first server in the process starts. All body
//! transfer is demand-gated: request bodies are read from the socket
//! only as the handler consumes them, and response bodies are pulled
//! from the application only as the connection can take them.

#[macro_use]
mod common;

pub mod body;
mod channel;
mod error;
mod handler;
mod media;
mod proto;
pub mod recover;
mod request;
pub mod response;
pub mod route;
mod server;

pub use crate::body::Body;
pub use crate::channel::Channel;
pub use crate::error::{Error, Rejection, Result};
pub use crate::handler::{respond_with, Consumes, Endpoint, Handler, HandlerFuture, RespondWith};
pub use crate::recover::{ErrorHandler, ErrorHandlerFuture, Recovery};
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::route::Route;
pub use crate::server::{Server, ServerConfig, Shutdown};

#[doc(no_inline)]
pub use http::{header, HeaderMap, Method, StatusCode, Version};
