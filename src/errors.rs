use std::{error, fmt, io};

/// Reasons a single connection is aborted without a response.
#[derive(Debug, PartialEq)]
pub(crate) enum ErrorKind {
    InvalidMethod,
    InvalidPath,

    RequestTooLarge,
    InvalidContentLength,
    BodyTooLarge,

    PeerClosed,
    Io(IoError),
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMethod => f.write_str("unsupported request method"),
            Self::InvalidPath => f.write_str("malformed request target"),
            Self::RequestTooLarge => f.write_str("request header exceeds receive buffer"),
            Self::InvalidContentLength => f.write_str("invalid content-length"),
            Self::BodyTooLarge => f.write_str("request body too large"),
            Self::PeerClosed => f.write_str("peer closed before request completed"),
            Self::Io(err) => write!(f, "i/o error: {}", err.0),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        ErrorKind::Io(IoError(err))
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

/// Server-level failures.
///
/// Returned when building or launching a [`Server`](crate::Server), and from
/// [`ServerHandle::shutdown`](crate::ServerHandle::shutdown) when the acceptor
/// or a worker loop stopped on a fatal multiplexer error.
#[derive(Debug)]
pub enum Error {
    /// An operating system call failed (poll creation, registration, wait).
    Io(io::Error),
    /// A configuration value cannot be used; the message names the field.
    InvalidConfig(&'static str),
    /// [`ServerBuilder::build`](crate::ServerBuilder::build) was called
    /// without a listener.
    MissingListener,
    /// The named server thread panicked.
    ThreadPanicked(&'static str),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error: {err}"),
            Self::InvalidConfig(field) => write!(f, "invalid configuration: {field}"),
            Self::MissingListener => f.write_str("the `listener` method must be called to build"),
            Self::ThreadPanicked(role) => write!(f, "{role} thread panicked"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}
