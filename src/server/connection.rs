use crate::{
    errors::ErrorKind,
    http::{
        request::{find_header_end, parse_head, RecvBuffer, HEADER_END},
        response::Response,
        types::Method,
    },
    limits::{ConnLimits, Documents},
};
use mio::net::TcpStream;
use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};
use tracing::{debug, warn};

/// Protocol state of one connection.
///
/// ```text
/// Established -> ReadingHeader -> (ReadingBody) -> RequestReceived
///     -> BuildingResponse -> SendingHeader -> (SendingBody) -> ResponseSent
/// ```
/// Any read or write step may end in `Aborted` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Established,
    ReadingHeader,
    ReadingBody,
    RequestReceived,
    BuildingResponse,
    SendingHeader,
    SendingBody,
    ResponseSent,
    Aborted,
}

impl State {
    #[inline(always)]
    pub(crate) const fn is_terminal(self) -> bool {
        matches!(self, State::ResponseSent | State::Aborted)
    }
}

/// Outcome of one [`Connection::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Progress was made; stepping again may make more.
    Continue,
    /// The socket would block; wait for the next readiness event.
    Blocked,
    /// Terminal: deregister and drop the connection.
    Remove,
}

/// One accepted socket and everything needed to answer it.
///
/// Owned by a single worker from dequeue to drop; dropping it closes the
/// socket and, if still open, the body file.
pub(crate) struct Connection {
    stream: TcpStream,
    peer: Option<SocketAddr>,

    buffer: RecvBuffer,
    scanned: usize,
    state: State,

    method: Option<Method>,
    target: Option<String>,
    body_remaining: usize,
    max_body_size: usize,

    response: Option<Response>,
}

impl Connection {
    #[inline]
    pub(crate) fn new(stream: TcpStream, limits: &ConnLimits) -> Self {
        Self {
            peer: stream.peer_addr().ok(),
            stream,

            buffer: RecvBuffer::new(limits.request_buffer_size),
            scanned: 0,
            state: State::Established,

            method: None,
            target: None,
            body_remaining: 0,
            max_body_size: limits.max_body_size,

            response: None,
        }
    }

    #[inline(always)]
    pub(crate) const fn state(&self) -> State {
        self.state
    }

    #[inline(always)]
    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline(always)]
    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    #[cfg(test)]
    pub(crate) fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Performs at most one I/O attempt for the current state.
    ///
    /// Safe to call again after any outcome; once the connection is terminal
    /// every call returns [`Flow::Remove`].
    pub(crate) fn step(&mut self, documents: &Documents) -> Flow {
        let result = match self.state {
            State::Established | State::ReadingHeader => self.read_header(),
            State::ReadingBody => self.read_body(),
            State::RequestReceived | State::BuildingResponse => self.build_response(documents),
            State::SendingHeader => self.send_header(),
            State::SendingBody => self.send_body(),
            State::ResponseSent | State::Aborted => Ok(Flow::Remove),
        };

        match result {
            Ok(_) if self.state.is_terminal() => Flow::Remove,
            Ok(flow) => flow,
            Err(err) => {
                warn!(peer = ?self.peer, state = ?self.state, error = %err, "connection aborted");
                self.state = State::Aborted;
                Flow::Remove
            }
        }
    }

    fn read_header(&mut self) -> Result<Flow, ErrorKind> {
        if self.buffer.is_full() {
            return Err(ErrorKind::RequestTooLarge);
        }

        let n = match self.stream.read(self.buffer.spare_mut()) {
            Ok(0) => return Err(ErrorKind::PeerClosed),
            Ok(n) => n,
            Err(err) => return would_block(err),
        };
        self.buffer.advance(n);
        self.state = State::ReadingHeader;

        let Some(end) = find_header_end(self.buffer.filled(), self.scanned) else {
            self.scanned = self.buffer.len().saturating_sub(HEADER_END.len() - 1);
            return Ok(Flow::Continue);
        };

        let head = parse_head(self.buffer.filled(), end)?;
        let declared = head.content_length.unwrap_or(0);
        if declared > self.max_body_size {
            return Err(ErrorKind::BodyTooLarge);
        }

        let buffered = self.buffer.len() - head.header_len;
        self.body_remaining = declared.saturating_sub(buffered);
        self.method = Some(head.method);
        self.target = Some(head.target);

        self.state = match self.body_remaining {
            0 => State::RequestReceived,
            _ => State::ReadingBody,
        };
        debug!(peer = ?self.peer, method = ?head.method, "request header received");

        Ok(Flow::Continue)
    }

    // The body is read and discarded so the socket holds no unread input
    // when it is closed.
    fn read_body(&mut self) -> Result<Flow, ErrorKind> {
        let mut scratch = [0u8; 4096];
        let len = self.body_remaining.min(scratch.len());

        let n = match self.stream.read(&mut scratch[..len]) {
            Ok(0) => return Err(ErrorKind::PeerClosed),
            Ok(n) => n,
            Err(err) => return would_block(err),
        };

        self.body_remaining -= n;
        if self.body_remaining == 0 {
            self.state = State::RequestReceived;
        }

        Ok(Flow::Continue)
    }

    fn build_response(&mut self, documents: &Documents) -> Result<Flow, ErrorKind> {
        self.state = State::BuildingResponse;

        let (Some(method), Some(target)) = (self.method, self.target.as_deref()) else {
            return Err(ErrorKind::InvalidPath);
        };

        let response = Response::build(method, target, documents);
        debug!(
            peer = ?self.peer,
            path = %target,
            status = response.status().as_u16(),
            reason = response.status().reason(),
            "response built"
        );

        self.response = Some(response);
        self.state = State::SendingHeader;

        Ok(Flow::Continue)
    }

    fn send_header(&mut self) -> Result<Flow, ErrorKind> {
        let Some(response) = self.response.as_mut() else {
            return Err(ErrorKind::InvalidPath);
        };

        let n = match self.stream.write(response.pending_header()) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => n,
            Err(err) => return would_block(err),
        };

        response.header_cursor_mut().advance(n);
        if response.header_cursor().is_done() {
            self.state = match response.has_body() {
                true => State::SendingBody,
                false => State::ResponseSent,
            };
        }

        Ok(Flow::Continue)
    }

    fn send_body(&mut self) -> Result<Flow, ErrorKind> {
        let Some(response) = self.response.as_mut() else {
            return Err(ErrorKind::InvalidPath);
        };

        match response.send_body(&mut self.stream) {
            Ok(_) if !response.has_body() => {
                debug!(peer = ?self.peer, bytes = response.body_cursor().total(), "body sent");
                self.state = State::ResponseSent;
            }
            Ok(_) => {}
            Err(err) if is_retryable(&err) => return would_block(err),
            Err(err) => {
                // Best effort: the header is out, there is nothing to retry.
                warn!(peer = ?self.peer, error = %err, "body transfer failed");
                response.close_body();
                self.state = State::ResponseSent;
            }
        }

        Ok(Flow::Continue)
    }
}

#[inline]
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Maps the non-fatal outcomes of a non-blocking call, passes the rest on.
#[inline]
fn would_block(err: io::Error) -> Result<Flow, ErrorKind> {
    match err.kind() {
        io::ErrorKind::WouldBlock => Ok(Flow::Blocked),
        io::ErrorKind::Interrupted => Ok(Flow::Continue),
        _ => Err(err.into()),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{
        fs,
        net::{self, TcpListener},
        thread,
        time::{Duration, Instant},
    };
    use tempfile::TempDir;

    pub(crate) const INDEX: &str = "<!doctype html><p>index</p>\n";

    pub(crate) fn site() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), INDEX).unwrap();
        fs::write(dir.path().join("404.html"), "<p>404</p>\n").unwrap();
        dir
    }

    fn pair(limits: &ConnLimits) -> (Connection, net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        (Connection::new(TcpStream::from_std(server), limits), client)
    }

    fn check_cursors(conn: &Connection) {
        if let Some(resp) = conn.response() {
            let header = resp.header_cursor();
            assert_eq!(header.written() + header.remaining(), header.total());
            assert_eq!(header.remaining(), resp.pending_header().len());

            let body = resp.body_cursor();
            assert_eq!(body.written() + body.remaining(), body.total());
            assert_eq!(resp.has_body(), !body.is_done());
        }
    }

    /// Steps until `stop` holds or the connection asks to be removed.
    fn drive_until(
        conn: &mut Connection,
        docs: &Documents,
        stop: impl Fn(State) -> bool,
    ) -> Flow {
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            let flow = conn.step(docs);
            check_cursors(conn);

            if flow == Flow::Remove || stop(conn.state()) {
                return flow;
            }
            if flow == Flow::Blocked {
                assert!(Instant::now() < deadline, "connection stalled");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn read_all(mut client: net::TcpStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn get_index() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        assert_eq!(conn.state(), State::Established);
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        assert_eq!(
            drive_until(&mut conn, &docs, |s| s == State::RequestReceived),
            Flow::Continue
        );
        assert_eq!(conn.method, Some(Method::Get));
        assert_eq!(conn.target.as_deref(), Some("/"));

        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = read_all(client);
        let (header, body) = reply.split_once("\r\n\r\n").unwrap();
        assert!(header.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(header.contains("Content-Type: text/html; charset=utf-8"));
        assert!(header.contains(&format!("Content-Length: {}", INDEX.len())));
        assert_eq!(body, INDEX);
    }

    #[test]
    fn missing_target() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        client.write_all(b"GET /missing HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = read_all(client);
        assert!(reply.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(reply.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn head_sends_header_only() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        client.write_all(b"HEAD / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = read_all(client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(&format!("Content-Length: {}\r\n\r\n", INDEX.len())));
    }

    #[test]
    fn unsupported_method_gets_no_bytes() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());

        for request in ["PUT / HTTP/1.1\r\n\r\n", "get / HTTP/1.1\r\n\r\n", "BREW /pot HTTP/1.1\r\n\r\n"] {
            let (mut conn, mut client) = pair(&ConnLimits::default());

            client.write_all(request.as_bytes()).unwrap();
            assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
            assert_eq!(conn.state(), State::Aborted);
            assert!(conn.response().is_none());
            drop(conn);

            let mut buf = [0u8; 64];
            assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        }
    }

    #[test]
    fn oversized_header_aborts() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let limits = ConnLimits {
            request_buffer_size: 16,
            ..ConnLimits::default()
        };
        let (mut conn, mut client) = pair(&limits);

        client.write_all(b"GET /a-rather-long-target HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::Aborted);
        assert!(conn.response().is_none());
    }

    #[test]
    fn header_exactly_filling_buffer() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let request = b"GET / HTTP/1.1\r\n\r\n";
        let limits = ConnLimits {
            request_buffer_size: request.len(),
            ..ConnLimits::default()
        };
        let (mut conn, mut client) = pair(&limits);

        client.write_all(request).unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
    }

    #[test]
    fn one_byte_at_a_time() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());
        let request = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

        for (i, byte) in request.iter().enumerate() {
            client.write_all(&[*byte]).unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            while conn.buffer.len() < i + 1 {
                match conn.step(&docs) {
                    Flow::Remove => panic!("removed after {i} bytes"),
                    Flow::Blocked => thread::sleep(Duration::from_millis(1)),
                    Flow::Continue => {}
                }
                assert!(Instant::now() < deadline, "byte {i} never arrived");
            }

            match i + 1 == request.len() {
                true => assert_eq!(conn.state(), State::RequestReceived),
                false => assert_eq!(conn.state(), State::ReadingHeader),
            }
        }

        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        drop(conn);

        let reply = read_all(client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(INDEX));
    }

    #[test]
    fn peer_close_before_request() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, client) = pair(&ConnLimits::default());

        drop(client);
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::Aborted);

        // Terminal connections stay terminal.
        assert_eq!(conn.step(&docs), Flow::Remove);
        assert_eq!(conn.state(), State::Aborted);
    }

    #[test]
    fn post_body_is_drained() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123")
            .unwrap();
        drive_until(&mut conn, &docs, |s| s == State::ReadingBody);
        assert_eq!(conn.state(), State::ReadingBody);
        assert_eq!(conn.body_remaining, 6);

        client.write_all(b"456789").unwrap();
        drive_until(&mut conn, &docs, |s| s == State::RequestReceived);
        assert_eq!(conn.body_remaining, 0);

        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = read_all(client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(INDEX));
    }

    #[test]
    fn get_with_declared_body_is_drained() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        client
            .write_all(b"GET / HTTP/1.1\r\nContent-Length: 6\r\n\r\n")
            .unwrap();
        drive_until(&mut conn, &docs, |s| s == State::ReadingBody);
        assert_eq!(conn.state(), State::ReadingBody);
        assert_eq!(conn.body_remaining, 6);

        client.write_all(b"abcdef").unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = read_all(client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with(INDEX));
    }

    #[test]
    fn post_body_over_limit_aborts() {
        let dir = site();
        let docs = Documents::in_dir(dir.path());
        let limits = ConnLimits {
            max_body_size: 8,
            ..ConnLimits::default()
        };
        let (mut conn, mut client) = pair(&limits);

        client
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n")
            .unwrap();
        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::Aborted);
    }

    #[test]
    fn large_body_partial_transfers() {
        let dir = site();
        let big: String = (0..200_000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        fs::write(dir.path().join("index.html"), &big).unwrap();
        let docs = Documents::in_dir(dir.path());
        let (mut conn, mut client) = pair(&ConnLimits::default());

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let reader = thread::spawn(move || read_all(client));

        assert_eq!(drive_until(&mut conn, &docs, |_| false), Flow::Remove);
        assert_eq!(conn.state(), State::ResponseSent);
        drop(conn);

        let reply = reader.join().unwrap();
        let (header, body) = reply.split_once("\r\n\r\n").unwrap();
        assert!(header.contains(&format!("Content-Length: {}", big.len())));
        assert_eq!(body, big);
    }
}
