//! mhttpd - Multi-threaded, non-blocking static-document HTTP server
//!
//! One acceptor thread accepts TCP connections and hands them through a
//! bounded queue to a fixed pool of worker threads. Each worker drives its
//! connections through a small state machine on top of its own readiness
//! poll, so one slow client never blocks the rest.
//!
//! # What it serves
//!
//! - `GET /` answers `200 OK` with the index document
//! - Any other `GET` target answers `404 Not Found` with an empty body; the
//!   not-found document is only opened to pick the status
//! - `HEAD` answers like `GET` without a body
//! - `POST` is answered like `GET`
//! - Anything else closes the connection without a reply
//!
//! A declared request body is read and discarded before answering. The
//! connection is closed after every response. Bodies are copied from the
//! file straight to the socket (`sendfile` on Linux).
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use mhttpd::{Server, limits::Documents};
//! use std::net::TcpListener;
//!
//! let handle = Server::builder()
//!     .listener(TcpListener::bind("127.0.0.1:8000").unwrap())
//!     .documents(Documents::in_dir("./public"))
//!     .build()
//!     .unwrap()
//!     .launch()
//!     .unwrap();
//!
//! // Stop from another thread or a signal handler.
//! let trigger = handle.shutdown_trigger();
//! std::thread::spawn(move || {
//!     std::thread::sleep(std::time::Duration::from_secs(60));
//!     trigger.trigger();
//! });
//!
//! handle.join().unwrap();
//! ```
//!
//! Configuration lives in [`limits`].

pub(crate) mod http {
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod acceptor;
    pub(crate) mod connection;
    pub(crate) mod queue;
    pub(crate) mod server_impl;
    pub(crate) mod worker;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::Error,
    server::server_impl::{Lifecycle, Server, ServerBuilder, ServerHandle, ShutdownTrigger},
};
