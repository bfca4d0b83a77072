use crate::{
    errors::ErrorKind,
    http::types::{slice_to_usize, Method},
};
use memchr::{memchr, memmem};

/// End of the header block.
pub(crate) const HEADER_END: &[u8] = b"\r\n\r\n";
const CRLF: &[u8] = b"\r\n";

/// Fixed-capacity receive buffer.
///
/// `filled` counts the bytes received so far and never exceeds the capacity
/// chosen at construction; the buffer never grows.
#[derive(Debug)]
pub(crate) struct RecvBuffer {
    buffer: Box<[u8]>,
    filled: usize,
}

impl RecvBuffer {
    #[inline]
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    #[inline(always)]
    pub(crate) fn is_full(&self) -> bool {
        self.filled == self.buffer.len()
    }

    #[inline(always)]
    pub(crate) fn len(&self) -> usize {
        self.filled
    }

    #[inline(always)]
    pub(crate) fn filled(&self) -> &[u8] {
        &self.buffer[..self.filled]
    }

    /// Unused tail of the buffer, where the next read lands.
    #[inline(always)]
    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.filled..]
    }

    #[inline(always)]
    pub(crate) fn advance(&mut self, n: usize) {
        assert!(
            n <= self.buffer.len() - self.filled,
            "advance past the end of the receive buffer"
        );
        self.filled += n;
    }
}

/// Request line and the header facts the server acts on.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) target: String,
    /// Length of the header block, terminator included.
    pub(crate) header_len: usize,
    /// Declared body length, whatever the method.
    pub(crate) content_length: Option<usize>,
}

/// Searches `buf` for the end of the header block, starting at `from`.
///
/// Callers pass the previous buffer length minus three as `from`, so bytes
/// that arrive one at a time are not rescanned from the start.
#[inline]
pub(crate) fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let from = from.min(buf.len());
    memmem::find(&buf[from..], HEADER_END).map(|pos| from + pos + HEADER_END.len())
}

/// Parses a complete header block (`buf[..header_len]` ends with
/// [`HEADER_END`]).
///
/// Accepts exactly `GET <path> `, `POST <path> ` and `HEAD <path> ` as
/// request line prefixes; the rest of the line is not inspected.
pub(crate) fn parse_head(buf: &[u8], header_len: usize) -> Result<RequestHead, ErrorKind> {
    let head = &buf[..header_len];
    let line_end = memmem::find(head, CRLF).ok_or(ErrorKind::InvalidPath)?;
    let line = &head[..line_end];

    let (method, start) = Method::from_bytes(line)?;

    let target_len = memchr(b' ', &line[start..]).ok_or(ErrorKind::InvalidPath)?;
    if target_len == 0 {
        return Err(ErrorKind::InvalidPath);
    }
    let target = simdutf8::basic::from_utf8(&line[start..start + target_len])
        .map_err(|_| ErrorKind::InvalidPath)?
        .to_owned();

    let content_length = content_length(&head[line_end + CRLF.len()..])?;

    Ok(RequestHead {
        method,
        target,
        header_len,
        content_length,
    })
}

fn content_length(fields: &[u8]) -> Result<Option<usize>, ErrorKind> {
    for line in fields.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = memchr(b':', line) else {
            continue;
        };

        if !trim(&line[..colon]).eq_ignore_ascii_case(b"content-length") {
            continue;
        }

        return slice_to_usize(trim(&line[colon + 1..]))
            .map(Some)
            .ok_or(ErrorKind::InvalidContentLength);
    }

    Ok(None)
}

#[inline]
fn trim(mut src: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = src {
        src = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = src {
        src = rest;
    }
    src
}
