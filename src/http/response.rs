use crate::{
    http::types::{Method, StatusCode},
    limits::Documents,
};
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};
use tracing::warn;

pub(crate) const SERVER: &[u8] = b"Server: mhttpd/0.1\r\n";
pub(crate) const CONTENT_TYPE: &str = "text/html";
pub(crate) const CHARSET: &str = "utf-8";
const CACHE_CONTROL: &[u8] = b"Cache-Control: private, max-age=0, proxy-revalidate, \
    no-store, no-cache, must-revalidate\r\n";

/// Progress through a byte sequence of known length.
///
/// `written + remaining` is the total length for the whole life of the
/// cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Cursor {
    written: usize,
    remaining: usize,
}

impl Cursor {
    #[inline(always)]
    pub(crate) const fn new(total: usize) -> Self {
        Self {
            written: 0,
            remaining: total,
        }
    }

    #[inline(always)]
    pub(crate) const fn written(&self) -> usize {
        self.written
    }

    #[inline(always)]
    pub(crate) const fn remaining(&self) -> usize {
        self.remaining
    }

    #[inline(always)]
    pub(crate) const fn total(&self) -> usize {
        self.written + self.remaining
    }

    #[inline(always)]
    pub(crate) const fn is_done(&self) -> bool {
        self.remaining == 0
    }

    #[inline]
    pub(crate) fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining, "cursor advanced past its end");
        self.written += n;
        self.remaining -= n;
    }
}

/// A response under transmission.
///
/// The header is serialized once, when the response is built; the body is
/// never read into memory and is streamed straight from `body` to the socket.
#[derive(Debug)]
pub(crate) struct Response {
    status: StatusCode,

    header: Vec<u8>,
    header_cursor: Cursor,

    /// Open iff the body still has bytes to send.
    body: Option<File>,
    body_cursor: Cursor,
}

impl Response {
    /// Resolves `target` against the two documents and prepares the header.
    ///
    /// Never fails: open and stat errors become `403`, `404` or `500`
    /// responses with an empty body.
    pub(crate) fn build(method: Method, target: &str, documents: &Documents) -> Self {
        let (path, status) = route(target, documents);
        let (status, document) = open_document(&path, status);

        let (content_length, body) = match (status, document) {
            (StatusCode::Ok, Some((file, len))) => {
                let body = (method != Method::Head && len > 0).then_some(file);
                (len, body)
            }
            _ => (0, None),
        };

        let header = Self::serialize_header(status, content_length);
        let body_cursor = Cursor::new(body.as_ref().map_or(0, |_| content_length));

        Self {
            status,
            header_cursor: Cursor::new(header.len()),
            header,
            body,
            body_cursor,
        }
    }

    fn serialize_header(status: StatusCode, content_length: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(256);

        header.extend_from_slice(status.first_line());
        header.extend_from_slice(SERVER);
        header.extend_from_slice(b"Content-Type: ");
        header.extend_from_slice(CONTENT_TYPE.as_bytes());
        header.extend_from_slice(b"; charset=");
        header.extend_from_slice(CHARSET.as_bytes());
        header.extend_from_slice(b"\r\n");
        header.extend_from_slice(CACHE_CONTROL);

        let (arr, start) = Self::number_to_bytes(content_length as u64);
        header.extend_from_slice(b"Content-Length: ");
        header.extend_from_slice(&arr[start..]);
        header.extend_from_slice(b"\r\n\r\n");

        header
    }

    #[inline]
    const fn number_to_bytes(mut n: u64) -> ([u8; 20], usize) {
        let mut buffer = [b'0'; 20];
        let mut i = 20;

        if n == 0 {
            return (buffer, 19);
        }

        while n > 0 {
            i -= 1;
            buffer[i] = b'0' + (n % 10) as u8;
            n /= 10;
        }

        (buffer, i)
    }

    #[inline(always)]
    pub(crate) const fn status(&self) -> StatusCode {
        self.status
    }

    /// Header bytes not yet written.
    #[inline(always)]
    pub(crate) fn pending_header(&self) -> &[u8] {
        &self.header[self.header_cursor.written()..]
    }

    #[inline(always)]
    pub(crate) fn header_cursor(&self) -> &Cursor {
        &self.header_cursor
    }

    #[inline(always)]
    pub(crate) fn header_cursor_mut(&mut self) -> &mut Cursor {
        &mut self.header_cursor
    }

    #[inline(always)]
    pub(crate) fn body_cursor(&self) -> &Cursor {
        &self.body_cursor
    }

    #[inline(always)]
    pub(crate) fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Sends up to the rest of the body with one zero-copy transfer.
    ///
    /// Closes the file once the body is complete. Errors leave the file open;
    /// the caller decides whether to [`close_body`](Self::close_body).
    pub(crate) fn send_body<S>(&mut self, socket: &mut S) -> io::Result<usize>
    where
        S: io::Write + std::os::fd::AsRawFd,
    {
        let Some(file) = &self.body else {
            return Ok(0);
        };

        let n = transfer::send_file(
            socket,
            file,
            self.body_cursor.written(),
            self.body_cursor.remaining(),
        )?;

        if n == 0 {
            // The file shrank after it was measured.
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        self.body_cursor.advance(n);
        if self.body_cursor.is_done() {
            self.close_body();
        }

        Ok(n)
    }

    #[inline]
    pub(crate) fn close_body(&mut self) {
        self.body = None;
    }
}

/// `/` is the primary document, anything else the not-found document.
#[inline]
pub(crate) fn route(target: &str, documents: &Documents) -> (PathBuf, StatusCode) {
    match target {
        "/" => (documents.index_path(), StatusCode::Ok),
        _ => (documents.not_found_path(), StatusCode::NotFound),
    }
}

/// Opens a document and measures it.
///
/// Returns `status` with the file and its length on success; otherwise the
/// status describing the failure and no file.
fn open_document(path: &Path, status: StatusCode) -> (StatusCode, Option<(File, usize)>) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => return (status_for_open_error(&err), None),
    };

    match file.metadata() {
        Ok(meta) if meta.is_file() => match usize::try_from(meta.len()) {
            Ok(len) => (status, Some((file, len))),
            Err(_) => (StatusCode::InternalServerError, None),
        },
        Ok(_) => {
            warn!(path = %path.display(), "document is not a regular file");
            (StatusCode::InternalServerError, None)
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "fstat failed");
            (StatusCode::InternalServerError, None)
        }
    }
}

/// Missing file is `404`, permission denied is `403`, anything else `500`.
#[inline]
pub(crate) fn status_for_open_error(err: &io::Error) -> StatusCode {
    match err.kind() {
        io::ErrorKind::NotFound => StatusCode::NotFound,
        io::ErrorKind::PermissionDenied => StatusCode::Forbidden,
        _ => StatusCode::InternalServerError,
    }
}

pub(crate) mod transfer {
    use std::{fs::File, io, os::fd::AsRawFd};

    /// Copies up to `count` bytes of `file`, starting at `offset`, into the
    /// socket without staging them in user space.
    #[cfg(target_os = "linux")]
    pub(crate) fn send_file<S>(
        socket: &mut S,
        file: &File,
        offset: usize,
        count: usize,
    ) -> io::Result<usize>
    where
        S: io::Write + AsRawFd,
    {
        let mut offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        // SAFETY: both descriptors are owned by live objects borrowed for the
        // duration of the call, and `offset` outlives it.
        let n = unsafe { libc::sendfile(socket.as_raw_fd(), file.as_raw_fd(), &mut offset, count) };

        match n {
            n if n < 0 => Err(io::Error::last_os_error()),
            n => Ok(n as usize),
        }
    }

    /// Positioned read followed by one write; used where `sendfile(2)` has a
    /// different contract.
    #[cfg(not(target_os = "linux"))]
    pub(crate) fn send_file<S>(
        socket: &mut S,
        file: &File,
        offset: usize,
        count: usize,
    ) -> io::Result<usize>
    where
        S: io::Write + AsRawFd,
    {
        use std::os::unix::fs::FileExt;

        let mut chunk = [0u8; 16 * 1024];
        let len = count.min(chunk.len());
        let read = file.read_at(&mut chunk[..len], offset as u64)?;

        if read == 0 {
            return Ok(0);
        }

        socket.write(&chunk[..read])
    }
}
