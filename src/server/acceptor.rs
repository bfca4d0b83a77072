use crate::{
    limits::ConnLimits,
    server::{
        connection::Connection,
        server_impl::{Lifecycle, Shared},
    },
};
use mio::{
    net::{TcpListener, TcpStream},
    Events, Interest, Poll, Token,
};
use socket2::SockRef;
use std::{io, sync::Arc};
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);

/// Accepts connections and queues them for the workers.
///
/// Owns the listening socket; it is closed when the acceptor returns.
pub(crate) struct Acceptor {
    poll: Poll,
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Acceptor {
    pub(crate) fn new(mut listener: TcpListener, shared: Arc<Shared>) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            shared,
        })
    }

    /// Runs until the lifecycle leaves [`Lifecycle::Running`].
    ///
    /// Only a failing readiness wait ends the loop early; per-connection
    /// failures are logged and skipped.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(16);
        let timeout = self.shared.server_limits.accept_timeout;

        info!(addr = ?self.listener.local_addr().ok(), "acceptor started");

        // Set when accepting stopped before the backlog was drained. Readiness
        // is edge-triggered, so the rest is not reported again on its own.
        let mut pending = false;

        while self.shared.lifecycle() == Lifecycle::Running {
            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "acceptor wait failed");
                return Err(err);
            }

            if pending || events.iter().any(|event| event.token() == LISTENER) {
                pending = self.accept_ready();
            }
        }

        info!("acceptor stopped");
        Ok(())
    }

    /// Accepts every pending connection.
    ///
    /// Returns `true` if it gave up before the backlog was empty and must be
    /// called again without waiting for a new readiness event.
    fn accept_ready(&mut self) -> bool {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(value) => value,
                Err(err) => match AcceptFailure::of(&err) {
                    AcceptFailure::Drained => return false,
                    AcceptFailure::Skip => {
                        debug!(error = %err, "accept failed, skipping connection");
                        continue;
                    }
                    AcceptFailure::Retry => {
                        warn!(error = %err, "accept failed, retrying after the next wait");
                        return true;
                    }
                },
            };

            if let Err(err) = configure(&stream, &self.shared.conn_limits) {
                warn!(%peer, error = %err, "failed to configure accepted socket");
                continue;
            }

            let conn = Connection::new(stream, &self.shared.conn_limits);
            match self.shared.queue.enqueue(conn) {
                Ok(()) => trace!(%peer, queued = self.shared.queue.len(), "connection queued"),
                Err(conn) => debug!(peer = ?conn.peer(), "queue closed, dropping connection"),
            }
        }
    }
}

/// What a failed `accept` means for the rest of the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFailure {
    /// Nothing left to accept.
    Drained,
    /// Only this connection is lost; keep accepting.
    Skip,
    /// Out of descriptors or memory; try again after a wait.
    Retry,
}

impl AcceptFailure {
    fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::Drained,
            io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::PermissionDenied => Self::Skip,
            _ => match err.raw_os_error() {
                Some(libc::EPROTO | libc::ENETDOWN | libc::ENETUNREACH | libc::EHOSTUNREACH) => {
                    Self::Skip
                }
                _ => Self::Retry,
            },
        }
    }
}

/// Puts an accepted socket in the mode the workers expect.
#[inline]
pub(crate) fn configure(stream: &TcpStream, limits: &ConnLimits) -> io::Result<()> {
    let socket = SockRef::from(stream);

    socket.set_nonblocking(true)?;
    if limits.tcp_nodelay {
        socket.set_tcp_nodelay(true)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{self, TcpListener as StdListener};

    #[test]
    fn configure_accepted_socket() {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let _client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(server);

        let limits = ConnLimits {
            tcp_nodelay: true,
            ..ConnLimits::default()
        };
        configure(&stream, &limits).unwrap();

        let socket = SockRef::from(&stream);
        assert!(socket.tcp_nodelay().unwrap());
    }

    #[test]
    fn accept_failure_kinds() {
        #[rustfmt::skip]
        let cases = [
            (io::Error::from(io::ErrorKind::WouldBlock),        AcceptFailure::Drained),
            (io::Error::from(io::ErrorKind::Interrupted),       AcceptFailure::Skip),
            (io::Error::from(io::ErrorKind::ConnectionAborted), AcceptFailure::Skip),
            (io::Error::from(io::ErrorKind::ConnectionReset),   AcceptFailure::Skip),
            (io::Error::from_raw_os_error(libc::EPROTO),        AcceptFailure::Skip),
            (io::Error::from_raw_os_error(libc::EMFILE),        AcceptFailure::Retry),
            (io::Error::from_raw_os_error(libc::ENFILE),        AcceptFailure::Retry),
            (io::Error::from_raw_os_error(libc::ENOBUFS),       AcceptFailure::Retry),
        ];

        for (err, expected) in cases {
            assert_eq!(AcceptFailure::of(&err), expected, "{err}");
        }
    }

    #[test]
    fn drains_whole_backlog_in_one_call() {
        let std_listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        std_listener.set_nonblocking(true).unwrap();

        let shared = Arc::new(Shared::new(
            crate::limits::ServerLimits::default(),
            ConnLimits::default(),
            crate::limits::Documents::default(),
        ));
        let mut acceptor =
            Acceptor::new(TcpListener::from_std(std_listener), shared.clone()).unwrap();

        let _clients: Vec<_> = (0..3).map(|_| net::TcpStream::connect(addr).unwrap()).collect();
        std::thread::sleep(std::time::Duration::from_millis(20));

        assert!(!acceptor.accept_ready());
        assert_eq!(shared.queue.len(), 3);
    }
}
