use crate::server::{
    connection::{Connection, Flow, State},
    server_impl::{Lifecycle, Shared},
};
use mio::{event::Event, Events, Interest, Poll, Token};
use slab::Slab;
use std::{io, sync::Arc};
use tracing::{debug, error, info, trace, warn};

/// Drives the connections it pulled from the queue until each is done.
///
/// Every connection is registered with this worker's private poll instance
/// only, so no other thread ever touches it.
pub(crate) struct Worker {
    id: usize,
    poll: Poll,
    connections: Slab<Connection>,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(id: usize, shared: Arc<Shared>) -> io::Result<Self> {
        Ok(Self {
            id,
            poll: Poll::new()?,
            connections: Slab::with_capacity(shared.server_limits.registration_cap),
            shared,
        })
    }

    /// Runs until workers are asked to stop and nothing is left to serve.
    ///
    /// Returns an error if the poll instance fails; the connections this
    /// worker owned are closed on the way out.
    pub(crate) fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.shared.server_limits.max_events);
        let timeout = self.shared.server_limits.event_timeout;

        info!(worker = self.id, "worker started");

        while !self.is_finished() {
            self.register_queued()?;

            if let Err(err) = self.poll.poll(&mut events, Some(timeout)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(worker = self.id, error = %err, "worker wait failed");
                return Err(err);
            }

            for event in events.iter() {
                if let Some(key) = self.handle(event)? {
                    self.remove(key);
                }
            }
        }

        info!(worker = self.id, "worker stopped");
        Ok(())
    }

    #[inline]
    fn is_finished(&self) -> bool {
        self.shared.lifecycle() == Lifecycle::StoppingWorkers
            && self.connections.is_empty()
            && self.shared.queue.is_empty()
    }

    /// Registers up to `registration_cap` queued connections for reading.
    fn register_queued(&mut self) -> io::Result<()> {
        for _ in 0..self.shared.server_limits.registration_cap {
            let Some(mut conn) = self.shared.queue.try_dequeue() else {
                break;
            };

            let entry = self.connections.vacant_entry();
            let token = Token(entry.key());

            if let Err(err) = self
                .poll
                .registry()
                .register(conn.stream_mut(), token, Interest::READABLE)
            {
                error!(worker = self.id, peer = ?conn.peer(), error = %err, "register failed");
                return Err(err);
            }

            trace!(worker = self.id, peer = ?conn.peer(), key = token.0, "registered");
            entry.insert(conn);
        }

        Ok(())
    }

    /// Advances one ready connection. Returns its key if it must be removed.
    fn handle(&mut self, event: &Event) -> io::Result<Option<usize>> {
        let key = event.token().0;
        let Some(conn) = self.connections.get_mut(key) else {
            return Ok(None);
        };

        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            debug!(worker = self.id, peer = ?conn.peer(), state = ?conn.state(), "peer hung up");
            return Ok(Some(key));
        }

        // Readiness is edge-triggered: keep stepping until the socket would
        // block, or the connection changes direction or finishes.
        loop {
            match conn.step(&self.shared.documents) {
                Flow::Remove => return Ok(Some(key)),
                Flow::Blocked => return Ok(None),
                Flow::Continue if conn.state() == State::RequestReceived => {
                    self.poll.registry().reregister(
                        conn.stream_mut(),
                        event.token(),
                        Interest::WRITABLE,
                    )?;
                    return Ok(None);
                }
                Flow::Continue => {}
            }
        }
    }

    /// Deregisters and closes a connection.
    fn remove(&mut self, key: usize) {
        let Some(mut conn) = self.connections.try_remove(key) else {
            return;
        };

        if let Err(err) = self.poll.registry().deregister(conn.stream_mut()) {
            warn!(worker = self.id, peer = ?conn.peer(), error = %err, "deregister failed");
        }

        debug!(
            worker = self.id,
            peer = ?conn.peer(),
            state = ?conn.state(),
            registered = self.connections.len(),
            "connection closed"
        );
    }
}
