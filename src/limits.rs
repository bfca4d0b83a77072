//! Server configuration limits and timeouts
//!
//! # Memory Consumption
//!
//! Each registered connection holds one receive buffer of
//! [`ConnLimits::request_buffer_size`] bytes, one serialized response header
//! (a few hundred bytes) and, while the body is being sent, one open file.
//! Bodies are never staged in memory.
//!
//! # Examples
//!
//! ```no_run
//! use mhttpd::{Server, limits::{ConnLimits, Documents, ServerLimits}};
//! use std::{net::TcpListener, time::Duration};
//!
//! let server = Server::builder()
//!     .listener(TcpListener::bind("127.0.0.1:8000").unwrap())
//!     .documents(Documents::in_dir("/srv/www"))
//!     .server_limits(ServerLimits {
//!         workers: 4,
//!         event_timeout: Duration::from_millis(100),
//!         ..ServerLimits::default()
//!     })
//!     .connection_limits(ConnLimits {
//!         request_buffer_size: 1024,
//!         ..ConnLimits::default()
//!     })
//!     .build()
//!     .unwrap();
//!
//! let handle = server.launch().unwrap();
//! handle.shutdown().unwrap();
//! ```

use crate::errors::Error;
use std::{path::PathBuf, thread, time::Duration};

/// Controls server-level concurrency, queueing, and polling behavior.
///
/// # Connection management
/// ```text
///   [------------]
///   [ Tcp accept ]   acceptor thread, own poll instance
///   [------------]
///         ||
///         \/
/// /----------------\   Yes   [------------------------]
/// | Queue is full? | ======> [ Wait (wait_strategy)   ]
/// \----------------/         [------------------------]
///         || No
///         \/
///   [-------------]
///   [ Bounded queue ]
///   [-------------]
///         ||  try_dequeue, at most `registration_cap` per iteration
///         \/
///   [----------------]
///   [ Worker (xN)    ]   own poll instance, connections owned exclusively
///   [----------------]
/// ```
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Number of worker threads (default: available parallelism).
    pub workers: usize,

    /// Capacity of the queue between the acceptor and the workers
    /// (default: `256`).
    ///
    /// When the queue is full the acceptor stops accepting and waits
    /// according to `wait_strategy`; connections are never dropped.
    pub queue_capacity: usize,

    /// Maximum number of queued connections a worker registers per loop
    /// iteration (default: `64`).
    pub registration_cap: usize,

    /// Maximum number of readiness events a worker handles per wait
    /// (default: `64`).
    pub max_events: usize,

    /// Upper bound for a worker's readiness wait (default: `500 ms`).
    ///
    /// Also bounds how long newly queued connections may sit before the
    /// worker registers them, and how long shutdown takes to be observed.
    pub event_timeout: Duration,

    /// Upper bound for the acceptor's readiness wait (default: `10 ms`).
    pub accept_timeout: Duration,

    /// How the acceptor waits while the queue is full
    /// (default: `Sleep(50μs)`).
    pub wait_strategy: WaitStrategy,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            queue_capacity: 256,
            registration_cap: 64,
            max_events: 64,
            event_timeout: Duration::from_millis(500),
            accept_timeout: Duration::from_millis(10),
            wait_strategy: WaitStrategy::Sleep(Duration::from_micros(50)),

            _priv: (),
        }
    }
}

impl ServerLimits {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        match self {
            Self { workers: 0, .. } => Err(Error::InvalidConfig("workers")),
            Self {
                queue_capacity: 0, ..
            } => Err(Error::InvalidConfig("queue_capacity")),
            Self {
                registration_cap: 0,
                ..
            } => Err(Error::InvalidConfig("registration_cap")),
            Self { max_events: 0, .. } => Err(Error::InvalidConfig("max_events")),
            _ => Ok(()),
        }
    }
}

/// Strategy for a producer waiting on a full queue
///
/// Different strategies trade latency against CPU usage.
#[derive(Debug, Clone)]
pub enum WaitStrategy {
    /// While waiting, uses [`std::thread::yield_now()`]
    ///
    /// # Note
    /// Keeps a core busy for as long as the queue stays full.
    Yield,

    /// While waiting, uses [`std::thread::sleep()`]
    Sleep(Duration),

    /// Spins with exponential backoff, then falls back to yielding
    /// ([`crossbeam::utils::Backoff`]).
    Backoff,
}

/// Per-connection limits
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// Capacity of the receive buffer (default: `512` bytes).
    ///
    /// The request line and all headers, up to and including the blank line,
    /// must fit. A request that fills the buffer without completing its
    /// header is aborted.
    pub request_buffer_size: usize,

    /// Largest request body that is read and discarded before responding
    /// (default: `64 KiB`). Applies to any method declaring a
    /// `Content-Length`; larger declared bodies abort the connection.
    pub max_body_size: usize,

    /// Sets `TCP_NODELAY` on accepted sockets (default: `false`).
    pub tcp_nodelay: bool,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ConnLimits {
    #[inline(always)]
    fn default() -> Self {
        Self {
            request_buffer_size: 512,
            max_body_size: 64 * 1024,
            tcp_nodelay: false,

            _priv: (),
        }
    }
}

impl ConnLimits {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.request_buffer_size == 0 {
            return Err(Error::InvalidConfig("request_buffer_size"));
        }

        Ok(())
    }
}

/// The two documents the server resolves targets to.
///
/// `/` resolves to `index`, whose content is sent with `200`; every other
/// target resolves to `not_found`, which is opened only to pick the status.
/// Both are relative to `root` unless absolute.
#[derive(Debug, Clone, PartialEq)]
pub struct Documents {
    /// Directory the document names are resolved against (default: `.`).
    pub root: PathBuf,
    /// Primary document (default: `index.html`).
    pub index: PathBuf,
    /// Document opened for unknown targets (default: `404.html`). Only
    /// decides the status; the response body is always empty.
    pub not_found: PathBuf,
}

impl Default for Documents {
    fn default() -> Self {
        Self::in_dir(".")
    }
}

impl Documents {
    /// Default document names resolved inside `root`.
    pub fn in_dir<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            index: PathBuf::from("index.html"),
            not_found: PathBuf::from("404.html"),
        }
    }

    #[inline]
    pub(crate) fn index_path(&self) -> PathBuf {
        self.root.join(&self.index)
    }

    #[inline]
    pub(crate) fn not_found_path(&self) -> PathBuf {
        self.root.join(&self.not_found)
    }
}
