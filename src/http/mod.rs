//! Rate-limited HTTP GET with streamed bodies.
//!
//! [`HttpClient`] fetches firmware manifests and images. Every request first
//! passes the per-domain [`RateLimiterRegistry`]; a `429` response puts the
//! domain in a cooldown taken from `Retry-After`. Bodies never land in one
//! allocation: they are streamed through a [`DownloadSink`], which may refuse
//! more data to cancel the transfer.
//!
//! The network stack is the [`HttpTransport`] collaborator, created fresh
//! for each request by a [`TransportFactory`].
//!
//! ## Example
//!
//! ```rust,no_run
//! # use shocker_hub::http::{HttpClient, TransportFactory};
//! # fn demo<F: TransportFactory>(client: &HttpClient<F>) {
//! let res = client.get_string("https://firmware.openshock.org/version-stable.txt", &[], &[200], 10_000);
//! if let Ok(res) = res {
//!     println!("latest: {}", res.data.trim());
//! }
//! # }
//! ```

pub mod chunked;

use crate::consts::{
    HTTP_DEFAULT_RETRY_AFTER_S, HTTP_DOWNLOAD_SIZE_LIMIT, HTTP_MAX_RETRY_AFTER_S, HTTP_USER_AGENT,
};
use crate::ratelimit::RateLimiterRegistry;
use core::fmt;
use log::{error, warn};
use std::sync::Arc;

/// Status code for a server-side request timeout.
pub const HTTP_CODE_REQUEST_TIMEOUT: u16 = 408;
/// Status code for rate limiting.
pub const HTTP_CODE_TOO_MANY_REQUESTS: u16 = 429;

/// Failures of the network stack itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The connection could not be opened.
    #[error("connection failed")]
    Connect,
    /// The peer went away.
    #[error("connection lost")]
    Disconnected,
    /// Any other socket error.
    #[error("transport i/o error")]
    Io,
}

/// Why a request produced no usable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The URL has no host to rate limit against.
    #[error("invalid url")]
    InvalidUrl,
    /// The domain is cooling down, locally or at the server's request.
    #[error("rate limited")]
    RateLimited,
    /// The server answered with a status code the caller does not accept.
    #[error("unexpected response code {0}")]
    CodeRejected(u16),
    /// Transport error or malformed response.
    #[error("request failed")]
    RequestFailed,
    /// The deadline passed, or the server reported a timeout.
    #[error("request timed out")]
    TimedOut,
    /// The sink refused more data.
    #[error("request cancelled")]
    Cancelled,
}

/// A response that was read to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse<T> {
    /// Status code.
    pub code: u16,
    /// Body, or the number of body bytes streamed to the sink.
    pub data: T,
}

/// Non-blocking byte source for a response body.
pub trait ByteStream {
    /// Whether the connection is open or unread bytes remain.
    fn connected(&self) -> bool;

    /// Copies available bytes into `buf`.
    ///
    /// # Returns
    /// - `Ok(n)`: `n` bytes were copied
    /// - `Err(nb::Error::WouldBlock)`: nothing has arrived yet
    fn read_available(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError>;
}

/// One HTTP connection, as provided by the platform network stack.
pub trait HttpTransport: ByteStream {
    /// Opens a connection for `url`.
    fn begin(&mut self, url: &str, user_agent: &str) -> Result<(), TransportError>;
    /// Sends a GET with `headers` and returns the status code.
    fn get(&mut self, headers: &[(&str, &str)]) -> Result<u16, TransportError>;
    /// A response header, by case-insensitive name.
    fn header(&self, name: &str) -> Option<String>;
    /// Declared body length; `None` for chunked or unknown bodies.
    fn content_length(&self) -> Option<usize>;
}

/// Creates a fresh [`HttpTransport`] per request.
pub trait TransportFactory: Send + Sync {
    /// The transport type produced.
    type Transport: HttpTransport;
    /// A new, unconnected transport.
    fn create(&self) -> Self::Transport;
}

impl<F, T> TransportFactory for F
where
    F: Fn() -> T + Send + Sync,
    T: HttpTransport,
{
    type Transport = T;

    fn create(&self) -> T {
        self()
    }
}

/// Receiver of a streamed body.
pub trait DownloadSink {
    /// Called with the declared body length before any data.
    ///
    /// Returning `false` cancels the request.
    fn on_content_length(&mut self, _len: usize) -> bool {
        true
    }

    /// Called with each piece of body at its byte offset.
    ///
    /// Returning `false` cancels the request.
    fn on_chunk(&mut self, offset: usize, data: &[u8]) -> bool;
}

impl<F> DownloadSink for F
where
    F: FnMut(usize, &[u8]) -> bool,
{
    fn on_chunk(&mut self, offset: usize, data: &[u8]) -> bool {
        self(offset, data)
    }
}

#[derive(Debug, Default)]
struct StringSink {
    body: Vec<u8>,
}

impl DownloadSink for StringSink {
    fn on_content_length(&mut self, len: usize) -> bool {
        self.body.reserve(len);
        true
    }

    fn on_chunk(&mut self, _offset: usize, data: &[u8]) -> bool {
        self.body.extend_from_slice(data);
        true
    }
}

/// Parses a `Retry-After` value given in seconds.
///
/// HTTP dates and anything else that is not a positive integer fall back to
/// [`HTTP_DEFAULT_RETRY_AFTER_S`]. Longer delays are capped at
/// [`HTTP_MAX_RETRY_AFTER_S`].
pub fn retry_after_secs(value: Option<&str>) -> i64 {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|&s| s > 0)
        .map_or(HTTP_DEFAULT_RETRY_AFTER_S, |s| s.min(HTTP_MAX_RETRY_AFTER_S))
}

/// Rate-limited GET client.
pub struct HttpClient<F> {
    factory: F,
    limits: Arc<RateLimiterRegistry>,
}

impl<F> fmt::Debug for HttpClient<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<F: TransportFactory> HttpClient<F> {
    /// A client sharing `limits` with every other client of the process.
    pub fn new(factory: F, limits: Arc<RateLimiterRegistry>) -> Self {
        Self { factory, limits }
    }

    /// The rate limiters this client consults.
    pub fn limits(&self) -> &Arc<RateLimiterRegistry> {
        &self.limits
    }

    /// Streams the body of `url` into `sink`.
    ///
    /// # Arguments
    /// - `headers`: extra request headers
    /// - `accepted_codes`: status codes treated as success
    /// - `sink`: receives the body
    /// - `timeout_ms`: wall-clock budget for the whole request
    ///
    /// # Returns
    /// The status code and the number of body bytes delivered.
    pub fn download(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        accepted_codes: &[u16],
        sink: &mut dyn DownloadSink,
        timeout_ms: u32,
    ) -> Result<HttpResponse<usize>, RequestError> {
        let limiter = self.limits.limiter_for(url).ok_or(RequestError::InvalidUrl)?;
        let clock = self.limits.clock();

        if !limiter.try_request(clock.now_ms()) {
            return Err(RequestError::RateLimited);
        }

        let begin = clock.now_ms();
        let deadline = begin + i64::from(timeout_ms);
        let mut transport = self.factory.create();

        transport.begin(url, HTTP_USER_AGENT).map_err(|e| {
            error!("Failed to begin HTTP request: {e}");
            RequestError::RequestFailed
        })?;

        let code = transport.get(headers).map_err(|e| {
            error!("HTTP GET failed: {e}");
            RequestError::RequestFailed
        })?;

        if code == HTTP_CODE_REQUEST_TIMEOUT || clock.now_ms() > deadline {
            warn!("Request timed out");
            return Err(RequestError::TimedOut);
        }

        if code == HTTP_CODE_TOO_MANY_REQUESTS {
            let retry_after = retry_after_secs(transport.header("Retry-After").as_deref());
            warn!("Rate limited by server, backing off for {retry_after} s");
            limiter.block_until(clock.now_ms().saturating_add(retry_after.saturating_mul(1000)));
            return Err(RequestError::RateLimited);
        }

        if code == 418 {
            warn!("The server refused to brew coffee because it is, permanently, a teapot.");
        }

        if !accepted_codes.contains(&code) {
            error!("Received unexpected response code {code}");
            return Err(RequestError::CodeRejected(code));
        }

        let written = match transport.content_length() {
            Some(0) => 0,
            Some(len) => {
                if len > HTTP_DOWNLOAD_SIZE_LIMIT {
                    error!("Content-Length too large");
                    return Err(RequestError::RequestFailed);
                }
                if !sink.on_content_length(len) {
                    warn!("Request cancelled by callback");
                    return Err(RequestError::Cancelled);
                }
                chunked::read_fixed(&mut transport, len, sink, clock, deadline)?
            }
            None => chunked::read_chunked(&mut transport, sink, clock, deadline)?,
        };

        Ok(HttpResponse {
            code,
            data: written,
        })
    }

    /// Fetches `url` into a string; invalid UTF-8 is replaced.
    pub fn get_string(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        accepted_codes: &[u16],
        timeout_ms: u32,
    ) -> Result<HttpResponse<String>, RequestError> {
        let mut sink = StringSink::default();
        let res = self.download(url, headers, accepted_codes, &mut sink, timeout_ms)?;
        Ok(HttpResponse {
            code: res.code,
            data: String::from_utf8_lossy(&sink.body).into_owned(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::ratelimit::RateLimitPolicy;
    use parking_lot::Mutex;

    /// Body source handing out at most `split` bytes per read.
    #[derive(Debug, Clone)]
    pub(crate) struct ScriptedStream {
        data: Vec<u8>,
        pos: usize,
        split: usize,
        close_when_drained: bool,
        stall: Option<(ManualClock, i64)>,
    }

    impl ScriptedStream {
        pub(crate) fn new(data: &[u8], split: usize) -> Self {
            Self {
                data: data.to_vec(),
                pos: 0,
                split,
                close_when_drained: false,
                stall: None,
            }
        }

        pub(crate) fn close_when_drained(mut self) -> Self {
            self.close_when_drained = true;
            self
        }

        /// Advances `clock` by `step_ms` every time nothing is available.
        pub(crate) fn advancing(mut self, clock: ManualClock, step_ms: i64) -> Self {
            self.stall = Some((clock, step_ms));
            self
        }
    }

    impl ByteStream for ScriptedStream {
        fn connected(&self) -> bool {
            !(self.close_when_drained && self.pos == self.data.len())
        }

        fn read_available(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
            let n = self.split.min(buf.len()).min(self.data.len() - self.pos);
            if n == 0 {
                if let Some((clock, step)) = &self.stall {
                    clock.advance(*step);
                }
                return Err(nb::Error::WouldBlock);
            }
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[derive(Debug, Clone)]
    struct FakeTransport {
        code: u16,
        headers: Vec<(String, String)>,
        content_length: Option<usize>,
        body: ScriptedStream,
        requests: Arc<Mutex<Vec<String>>>,
    }

    impl ByteStream for FakeTransport {
        fn connected(&self) -> bool {
            self.body.connected()
        }

        fn read_available(&mut self, buf: &mut [u8]) -> nb::Result<usize, TransportError> {
            self.body.read_available(buf)
        }
    }

    impl HttpTransport for FakeTransport {
        fn begin(&mut self, url: &str, user_agent: &str) -> Result<(), TransportError> {
            assert_eq!(user_agent, HTTP_USER_AGENT);
            self.requests.lock().push(url.to_owned());
            Ok(())
        }

        fn get(&mut self, _headers: &[(&str, &str)]) -> Result<u16, TransportError> {
            Ok(self.code)
        }

        fn header(&self, name: &str) -> Option<String> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        }

        fn content_length(&self) -> Option<usize> {
            self.content_length
        }
    }

    struct Harness {
        clock: ManualClock,
        requests: Arc<Mutex<Vec<String>>>,
        client: HttpClient<Box<dyn Fn() -> FakeTransport + Send + Sync>>,
    }

    fn harness(code: u16, headers: &[(&str, &str)], content_length: Option<usize>, body: &[u8]) -> Harness {
        let clock = ManualClock::new(1_000);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let template = FakeTransport {
            code,
            headers: headers
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            content_length,
            body: ScriptedStream::new(body, 16).close_when_drained(),
            requests: Arc::clone(&requests),
        };
        let limits = Arc::new(RateLimiterRegistry::new(
            RateLimitPolicy::default(),
            Arc::new(clock.clone()),
        ));
        let factory: Box<dyn Fn() -> FakeTransport + Send + Sync> = Box::new(move || template.clone());
        Harness {
            clock,
            requests,
            client: HttpClient::new(factory, limits),
        }
    }

    const URL: &str = "https://firmware.openshock.org/version-stable.txt";

    #[test]
    fn test_get_string_chunked() {
        let h = harness(200, &[], None, b"6\r\n1.4.0\n\r\n0\r\n\r\n");

        let res = h.client.get_string(URL, &[], &[200], 10_000).unwrap();

        assert_eq!(res, HttpResponse { code: 200, data: "1.4.0\n".to_owned() });
        assert_eq!(*h.requests.lock(), vec![URL.to_owned()]);
    }

    #[test]
    fn test_download_fixed_length() {
        let h = harness(200, &[], Some(5), b"abcde");
        let mut announced = None;
        let mut body = Vec::new();

        struct Collect<'a>(&'a mut Option<usize>, &'a mut Vec<u8>);
        impl DownloadSink for Collect<'_> {
            fn on_content_length(&mut self, len: usize) -> bool {
                *self.0 = Some(len);
                true
            }
            fn on_chunk(&mut self, _offset: usize, data: &[u8]) -> bool {
                self.1.extend_from_slice(data);
                true
            }
        }

        let res = h
            .client
            .download(URL, &[("Accept", "*/*")], &[200], &mut Collect(&mut announced, &mut body), 10_000)
            .unwrap();

        assert_eq!(res.data, 5);
        assert_eq!(announced, Some(5));
        assert_eq!(body, b"abcde");
    }

    #[test]
    fn test_empty_body_succeeds_without_reading() {
        let h = harness(204, &[], Some(0), b"");

        let res = h.client.get_string(URL, &[], &[200, 204], 10_000).unwrap();

        assert_eq!(res.code, 204);
        assert!(res.data.is_empty());
    }

    #[test]
    fn test_too_many_requests_blocks_domain() {
        let h = harness(429, &[("Retry-After", "30")], None, b"");

        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::RateLimited));

        let limiter = h.client.limits().limiter_for(URL).unwrap();
        assert_eq!(limiter.blocked_until(), h.clock.now_ms() + 30_000);

        // Refused locally without touching the network
        h.clock.advance(29_000);
        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::RateLimited));
        assert_eq!(h.requests.lock().len(), 1);
    }

    #[test]
    fn test_retry_after_defaults() {
        assert_eq!(retry_after_secs(Some("120")), 120);
        assert_eq!(retry_after_secs(Some("Wed, 21 Oct 2015 07:28:00 GMT")), HTTP_DEFAULT_RETRY_AFTER_S);
        assert_eq!(retry_after_secs(Some("0")), HTTP_DEFAULT_RETRY_AFTER_S);
        assert_eq!(retry_after_secs(Some("-5")), HTTP_DEFAULT_RETRY_AFTER_S);
        assert_eq!(retry_after_secs(None), HTTP_DEFAULT_RETRY_AFTER_S);
        assert_eq!(retry_after_secs(Some("604800")), HTTP_MAX_RETRY_AFTER_S);
        assert_eq!(retry_after_secs(Some("99999999999999999999999")), HTTP_DEFAULT_RETRY_AFTER_S);
    }

    #[test]
    fn test_huge_retry_after_is_capped() {
        let h = harness(429, &[("Retry-After", "9223372036854775807")], None, b"");

        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::RateLimited));

        let limiter = h.client.limits().limiter_for(URL).unwrap();
        assert_eq!(
            limiter.blocked_until(),
            h.clock.now_ms() + HTTP_MAX_RETRY_AFTER_S * 1000
        );
    }

    #[test]
    fn test_status_handling() {
        let h = harness(404, &[], None, b"");
        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::CodeRejected(404)));

        let h = harness(408, &[], None, b"");
        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::TimedOut));

        let h = harness(200, &[], Some(HTTP_DOWNLOAD_SIZE_LIMIT + 1), b"");
        assert_eq!(h.client.get_string(URL, &[], &[200], 10_000), Err(RequestError::RequestFailed));
    }

    #[test]
    fn test_content_length_refusal_cancels() {
        let h = harness(200, &[], Some(4), b"data");

        struct Refuse;
        impl DownloadSink for Refuse {
            fn on_content_length(&mut self, _len: usize) -> bool {
                false
            }
            fn on_chunk(&mut self, _offset: usize, _data: &[u8]) -> bool {
                panic!("no data expected after refusal");
            }
        }

        assert_eq!(
            h.client.download(URL, &[], &[200], &mut Refuse, 10_000),
            Err(RequestError::Cancelled)
        );
    }

    #[test]
    fn test_url_without_host_is_invalid() {
        let h = harness(200, &[], None, b"");

        assert_eq!(h.client.get_string("/version.txt", &[], &[200], 10_000), Err(RequestError::InvalidUrl));
        assert!(h.requests.lock().is_empty());
    }
}
