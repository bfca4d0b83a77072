use crate::{
    errors::Error,
    limits::{ConnLimits, Documents, ServerLimits},
    server::{acceptor::Acceptor, connection::Connection, queue::BoundedQueue, worker::Worker},
};
use std::{
    io,
    net::{self, SocketAddr},
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, info, warn};

/// Shutdown phase of a running server.
///
/// Only ever moves forward: `Running` → `StoppingAcceptor` →
/// `StoppingWorkers`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Accepting and serving connections.
    Running = 0,
    /// Shutdown requested; the acceptor stops accepting.
    StoppingAcceptor = 1,
    /// Acceptor gone; workers finish their connections and exit.
    StoppingWorkers = 2,
}

impl Lifecycle {
    #[inline(always)]
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::StoppingAcceptor,
            _ => Self::StoppingWorkers,
        }
    }
}

/// State every server thread reads.
pub(crate) struct Shared {
    pub(crate) queue: BoundedQueue<Connection>,
    pub(crate) server_limits: ServerLimits,
    pub(crate) conn_limits: ConnLimits,
    pub(crate) documents: Documents,
    lifecycle: AtomicU8,
}

impl Shared {
    pub(crate) fn new(
        server_limits: ServerLimits,
        conn_limits: ConnLimits,
        documents: Documents,
    ) -> Self {
        Self {
            queue: BoundedQueue::new(
                server_limits.queue_capacity,
                server_limits.wait_strategy.clone(),
            ),
            server_limits,
            conn_limits,
            documents,
            lifecycle: AtomicU8::new(Lifecycle::Running as u8),
        }
    }

    #[inline(always)]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Moves the lifecycle to `to` unless it is already further along.
    #[inline]
    pub(crate) fn advance(&self, to: Lifecycle) {
        self.lifecycle.fetch_max(to as u8, Ordering::AcqRel);
    }
}

/// A static-document HTTP server.
///
/// One acceptor thread feeds accepted connections through a bounded queue
/// to a fixed set of worker threads. Every worker multiplexes its own
/// connections over a private poll instance.
///
/// # Examples
///
/// ```no_run
/// use mhttpd::{Server, limits::Documents};
/// use std::net::TcpListener;
///
/// let server = Server::builder()
///     .listener(TcpListener::bind("127.0.0.1:8000").unwrap())
///     .documents(Documents::in_dir("./public"))
///     .build()
///     .unwrap();
///
/// let handle = server.launch().unwrap();
/// // ...
/// handle.shutdown().unwrap();
/// ```
pub struct Server {
    listener: mio::net::TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl Server {
    /// Creates a new builder for configuring the server instance.
    #[inline]
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            listener: None,
            documents: None,

            server_limits: None,
            connection_limits: None,
        }
    }

    /// Address the server listens on.
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawns the acceptor and worker threads and returns at once.
    ///
    /// Poll instances are created before any thread starts, so a failure
    /// there is reported here instead of from a thread. If spawning fails
    /// part way, the threads already running are stopped and joined.
    pub fn launch(self) -> Result<ServerHandle, Error> {
        let Server {
            listener,
            local_addr,
            shared,
        } = self;

        let acceptor = Acceptor::new(listener, shared.clone())?;
        let workers = (0..shared.server_limits.workers)
            .map(|id| Worker::new(id, shared.clone()))
            .collect::<io::Result<Vec<_>>>()?;

        let mut handle = ServerHandle {
            local_addr,
            shared,
            acceptor: None,
            workers: Vec::with_capacity(workers.len()),
        };

        for (id, worker) in workers.into_iter().enumerate() {
            let spawned = thread::Builder::new()
                .name(format!("mhttpd-worker-{id}"))
                .spawn(move || worker.run());

            match spawned {
                Ok(thread) => handle.workers.push(thread),
                Err(err) => {
                    handle.abort();
                    return Err(err.into());
                }
            }
        }

        match thread::Builder::new()
            .name("mhttpd-acceptor".into())
            .spawn(move || acceptor.run())
        {
            Ok(thread) => handle.acceptor = Some(thread),
            Err(err) => {
                handle.abort();
                return Err(err.into());
            }
        }

        info!(
            %local_addr,
            workers = handle.workers.len(),
            queue_capacity = handle.shared.queue.capacity(),
            "server launched"
        );

        Ok(handle)
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder {
    listener: Option<net::TcpListener>,
    documents: Option<Documents>,

    server_limits: Option<ServerLimits>,
    connection_limits: Option<ConnLimits>,
}

impl ServerBuilder {
    /// Sets the bound listening socket.
    ///
    /// **This is a required component.** The socket is switched to
    /// non-blocking mode by [`build`](Self::build).
    #[inline(always)]
    pub fn listener(mut self, listener: net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Sets where the served documents live (default: [`Documents::default`]).
    #[inline(always)]
    pub fn documents(mut self, documents: Documents) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Configures threads, queueing and polling.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mhttpd::{Server, limits::{ServerLimits, WaitStrategy}};
    /// use std::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8000").unwrap())
    ///     .server_limits(ServerLimits {
    ///         workers: 8,
    ///         queue_capacity: 1024,
    ///         wait_strategy: WaitStrategy::Backoff,
    ///         ..ServerLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Configures per-connection limits.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use mhttpd::{Server, limits::ConnLimits};
    /// use std::net::TcpListener;
    ///
    /// let server = Server::builder()
    ///     .listener(TcpListener::bind("127.0.0.1:8000").unwrap())
    ///     .connection_limits(ConnLimits {
    ///         request_buffer_size: 2048,
    ///         tcp_nodelay: true,
    ///         ..ConnLimits::default() // Required line
    ///     })
    ///     .build();
    /// ```
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Finalizes the builder and constructs a [`Server`] instance.
    ///
    /// # Errors
    ///
    /// - [`Error::MissingListener`] if [`listener`](Self::listener) was not called.
    /// - [`Error::InvalidConfig`] naming the first limit that is out of range.
    /// - [`Error::Io`] if the listener cannot be made non-blocking.
    pub fn build(self) -> Result<Server, Error> {
        let listener = self.listener.ok_or(Error::MissingListener)?;
        let server_limits = self.server_limits.unwrap_or_default();
        let conn_limits = self.connection_limits.unwrap_or_default();
        let documents = self.documents.unwrap_or_default();

        server_limits.validate()?;
        conn_limits.validate()?;

        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        debug!(%local_addr, root = %documents.root.display(), "server built");

        Ok(Server {
            listener: mio::net::TcpListener::from_std(listener),
            local_addr,
            shared: Arc::new(Shared::new(server_limits, conn_limits, documents)),
        })
    }
}

/// Controls a launched [`Server`].
///
/// Dropping the handle does not stop the server; call
/// [`shutdown`](Self::shutdown) or trigger one and [`join`](Self::join).
pub struct ServerHandle {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    acceptor: Option<JoinHandle<io::Result<()>>>,
    workers: Vec<JoinHandle<io::Result<()>>>,
}

impl ServerHandle {
    #[inline(always)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline(always)]
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.lifecycle()
    }

    /// Returns a cloneable trigger that requests shutdown from anywhere,
    /// such as a signal handler.
    #[inline]
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            shared: self.shared.clone(),
        }
    }

    /// Requests shutdown and waits for every thread to finish.
    #[inline]
    pub fn shutdown(self) -> Result<(), Error> {
        self.shared.advance(Lifecycle::StoppingAcceptor);
        self.join()
    }

    /// Waits for the server to stop.
    ///
    /// Returns once the acceptor has exited (after a shutdown was triggered,
    /// or because it failed) and every worker has finished the connections
    /// it owned. Connections still queued are closed without a response.
    ///
    /// # Errors
    ///
    /// The first failure among the acceptor and the workers, in that order.
    pub fn join(mut self) -> Result<(), Error> {
        let mut result = Ok(());

        if let Some(acceptor) = self.acceptor.take() {
            result = flatten(acceptor.join(), "acceptor");
        }
        // No new connection can be queued past this point.
        self.shared.queue.close();
        self.shared.advance(Lifecycle::StoppingWorkers);

        for worker in self.workers.drain(..) {
            let outcome = flatten(worker.join(), "worker");
            if result.is_ok() {
                result = outcome;
            }
        }

        let mut dropped = 0usize;
        while self.shared.queue.try_dequeue().is_some() {
            dropped += 1;
        }
        if dropped != 0 {
            warn!(dropped, "closed queued connections left by failed workers");
        }

        info!(local_addr = %self.local_addr, "server stopped");
        result
    }

    /// Stops and joins whatever was spawned so far, ignoring the results.
    fn abort(&mut self) {
        self.shared.advance(Lifecycle::StoppingWorkers);
        self.shared.queue.close();

        for thread in self.acceptor.take().into_iter().chain(self.workers.drain(..)) {
            let _ = thread.join();
        }
    }
}

#[inline]
fn flatten(joined: thread::Result<io::Result<()>>, name: &'static str) -> Result<(), Error> {
    match joined {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::ThreadPanicked(name)),
    }
}

/// Requests shutdown of a running server.
#[derive(Clone)]
pub struct ShutdownTrigger {
    shared: Arc<Shared>,
}

impl ShutdownTrigger {
    /// Tells the acceptor to stop. Returns immediately; calling it again is
    /// a no-op.
    #[inline]
    pub fn trigger(&self) {
        self.shared.advance(Lifecycle::StoppingAcceptor);
    }
}
