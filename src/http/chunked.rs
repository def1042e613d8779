//! Streaming body readers.
//!
//! Two framings are supported:
//!
//! - **Fixed length**: the body is `Content-Length` bytes; every read is
//!   handed to the sink as it arrives.
//! - **Chunked**: the body is a sequence of `{hex size}[;ext]\r\n{payload}\r\n`
//!   chunks ending with a zero-size chunk. Bytes accumulate in a fixed
//!   buffer of [`HTTP_BUFFER_SIZE`]; every complete chunk is handed to the
//!   sink and removed from the front of the buffer.
//!
//! Both readers stop with [`RequestError::TimedOut`] once the clock passes
//! the deadline, with [`RequestError::Cancelled`] when the sink refuses data,
//! and with [`RequestError::RequestFailed`] on malformed framing or when the
//! connection closes early.

use super::{ByteStream, DownloadSink, RequestError};
use crate::clock::Clock;
use crate::consts::{
    HTTP_BUFFER_SIZE, HTTP_CHUNK_SIZE_FIELD_MAX, HTTP_DOWNLOAD_SIZE_LIMIT, HTTP_POLL_DELAY_MS,
};
use log::{debug, error, trace, warn};
use std::thread;
use std::time::Duration;

/// Result of one parse attempt over the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// A complete chunk is buffered.
    Ok,
    /// More bytes are needed before the next chunk can be parsed.
    NeedMoreData,
    /// The buffered bytes are not valid chunked encoding.
    Invalid,
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_hex_size(field: &[u8]) -> Option<usize> {
    if field.is_empty() || field.len() > HTTP_CHUNK_SIZE_FIELD_MAX {
        return None;
    }
    field.iter().try_fold(0usize, |acc, &c| {
        let digit = char::from(c).to_digit(16)?;
        acc.checked_mul(16)?.checked_add(digit as usize)
    })
}

/// Parses a chunk header at the start of `buf`.
///
/// # Returns
/// `(header_len, payload_len)` where `header_len` includes the CRLF.
fn parse_chunk_header(buf: &[u8]) -> Result<(usize, usize), ParserState> {
    // Smallest complete chunk is "0\r\n\r\n"
    if buf.len() < 5 {
        return Err(ParserState::NeedMoreData);
    }

    let header_len = find_crlf(buf).ok_or(ParserState::NeedMoreData)?;
    if header_len == 0 {
        warn!("Invalid chunk header length");
        return Err(ParserState::Invalid);
    }

    let header = &buf[..header_len];
    let size_field = header
        .iter()
        .position(|&c| c == b';')
        .map_or(header, |end| &header[..end]);

    let Some(payload_len) = parse_hex_size(size_field) else {
        warn!("Invalid chunk size field");
        return Err(ParserState::Invalid);
    };
    if payload_len > HTTP_DOWNLOAD_SIZE_LIMIT {
        warn!("Chunk size too large");
        return Err(ParserState::Invalid);
    }

    Ok((header_len + 2, payload_len))
}

/// Accumulating chunk parser over a fixed buffer.
#[derive(Debug)]
pub struct ChunkParser {
    buffer: Box<[u8]>,
    cursor: usize,
    payload_pos: usize,
    payload_len: usize,
}

impl Default for ChunkParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkParser {
    /// A parser with an empty [`HTTP_BUFFER_SIZE`] buffer.
    pub fn new() -> Self {
        Self::with_capacity(HTTP_BUFFER_SIZE)
    }

    /// A parser with an empty buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity].into_boxed_slice(),
            cursor: 0,
            payload_pos: 0,
            payload_len: 0,
        }
    }

    /// Free space at the end of the buffer, to be filled from the stream.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.cursor..]
    }

    /// Marks `n` bytes of [`ChunkParser::spare_mut`] as filled.
    pub fn commit(&mut self, n: usize) {
        self.cursor = (self.cursor + n).min(self.buffer.len());
    }

    /// Number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.cursor
    }

    /// Whether the buffer has no free space left.
    pub fn is_full(&self) -> bool {
        self.cursor == self.buffer.len()
    }

    /// Tries to parse the chunk at the front of the buffer.
    ///
    /// A parsed header is remembered, so calling again after more bytes
    /// arrive only re-checks the payload span.
    pub fn parse(&mut self) -> ParserState {
        let buf = &self.buffer[..self.cursor];

        if self.payload_pos == 0 {
            match parse_chunk_header(buf) {
                Ok((header_len, payload_len)) => {
                    self.payload_pos = header_len;
                    self.payload_len = payload_len;
                }
                Err(state) => return state,
            }
        }

        let total = self.payload_pos + self.payload_len + 2;
        if buf.len() < total {
            return ParserState::NeedMoreData;
        }
        if &buf[total - 2..total] != b"\r\n" {
            warn!("Invalid chunk payload CRLF");
            return ParserState::Invalid;
        }

        ParserState::Ok
    }

    /// Payload of the last successfully parsed chunk.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_pos..self.payload_pos + self.payload_len]
    }

    /// Drops the parsed chunk and moves the remaining bytes to the front.
    pub fn consume(&mut self) {
        let total = (self.payload_pos + self.payload_len + 2).min(self.cursor);
        self.buffer.copy_within(total..self.cursor, 0);
        self.cursor -= total;
        self.payload_pos = 0;
        self.payload_len = 0;
    }
}

fn timed_out(clock: &dyn Clock, deadline_ms: i64) -> bool {
    if clock.now_ms() > deadline_ms {
        warn!("Request timed out");
        return true;
    }
    false
}

/// Reads one batch of available bytes into `buf`.
///
/// # Returns
/// - `Ok(Some(n))`: `n > 0` bytes were read
/// - `Ok(None)`: nothing available yet, the caller should poll again
fn read_some<S>(stream: &mut S, buf: &mut [u8]) -> Result<Option<usize>, RequestError>
where
    S: ByteStream + ?Sized,
{
    match stream.read_available(buf) {
        Ok(0) => {
            warn!("No bytes read");
            Err(RequestError::RequestFailed)
        }
        Ok(n) => Ok(Some(n)),
        Err(nb::Error::WouldBlock) => {
            thread::sleep(Duration::from_millis(HTTP_POLL_DELAY_MS));
            Ok(None)
        }
        Err(nb::Error::Other(e)) => {
            error!("Stream read failed: {e}");
            Err(RequestError::RequestFailed)
        }
    }
}

/// Streams a chunked body into `sink`.
///
/// # Returns
/// Total payload bytes delivered, once the zero-size chunk arrives.
pub fn read_chunked<S>(
    stream: &mut S,
    sink: &mut dyn DownloadSink,
    clock: &dyn Clock,
    deadline_ms: i64,
) -> Result<usize, RequestError>
where
    S: ByteStream + ?Sized,
{
    let mut parser = ChunkParser::new();
    let mut written = 0usize;

    while stream.connected() {
        if timed_out(clock, deadline_ms) {
            return Err(RequestError::TimedOut);
        }

        let Some(n) = read_some(stream, parser.spare_mut())? else {
            continue;
        };
        parser.commit(n);

        loop {
            match parser.parse() {
                ParserState::Invalid => {
                    error!("Failed to parse chunk");
                    return Err(RequestError::RequestFailed);
                }
                ParserState::NeedMoreData if parser.is_full() => {
                    error!("Chunk too large for buffer");
                    return Err(RequestError::RequestFailed);
                }
                ParserState::NeedMoreData => break,
                ParserState::Ok => {}
            }

            let payload = parser.payload();
            let len = payload.len();
            trace!("Chunk parsed: {len} bytes at {written}");
            if len == 0 {
                debug!("Chunked transfer complete, {written} bytes");
                return Ok(written);
            }
            if !sink.on_chunk(written, payload) {
                warn!("Request cancelled by callback");
                return Err(RequestError::Cancelled);
            }

            written += len;
            parser.consume();
        }
    }

    warn!("Connection closed before the final chunk");
    Err(RequestError::RequestFailed)
}

/// Streams exactly `content_length` bytes into `sink`.
pub fn read_fixed<S>(
    stream: &mut S,
    content_length: usize,
    sink: &mut dyn DownloadSink,
    clock: &dyn Clock,
    deadline_ms: i64,
) -> Result<usize, RequestError>
where
    S: ByteStream + ?Sized,
{
    let mut buf = vec![0u8; HTTP_BUFFER_SIZE];
    let mut written = 0usize;

    while written < content_length {
        if !stream.connected() {
            warn!("Connection closed after {written} of {content_length} bytes");
            return Err(RequestError::RequestFailed);
        }
        if timed_out(clock, deadline_ms) {
            return Err(RequestError::TimedOut);
        }

        let want = buf.len().min(content_length - written);
        let Some(n) = read_some(stream, &mut buf[..want])? else {
            continue;
        };

        if !sink.on_chunk(written, &buf[..n]) {
            warn!("Request cancelled by callback");
            return Err(RequestError::Cancelled);
        }
        written += n;
    }

    Ok(written)
}
