//! Instrumented HTTP request execution.
//!
//! [`Agent::run`] issues a single HTTP request while hashing and counting
//! every byte on both sides of the transport encoding: the request body as
//! it is read, and the response body both as it arrives on the wire and
//! after any gzip decoding.  A [`CallSummary`] records what happened and is
//! returned whether or not the request succeeded, so diagnostics survive
//! errors.

use crate::error::Error;
use crate::queue::RequestDescriptor;
use crate::stream::{hex, DigestRead, StreamDigest};
use async_compression::tokio::bufread::GzipDecoder;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH};
use reqwest::{Body, Method};
use sha2::{Digest, Sha256};
use slog::{debug, warn, Logger};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::io::StreamReader;

/// The information needed to run one HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Build a request from a descriptor the queue returned.  Method, URL,
    /// and headers are used verbatim.
    pub fn from_descriptor(descriptor: &RequestDescriptor) -> Result<Request, Error> {
        let method = Method::from_bytes(descriptor.method.as_bytes()).map_err(|_| {
            Error::InvalidArgument(format!("invalid request method {}", descriptor.method))
        })?;
        let mut headers = HeaderMap::new();
        for (key, value) in &descriptor.headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|_| Error::InvalidArgument(format!("invalid header name {}", key)))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                Error::InvalidArgument(format!("invalid value for header {}", key))
            })?;
            if headers.contains_key(&name) {
                return Err(Error::InvalidArgument(format!(
                    "header key {} appears more than once",
                    key
                )));
            }
            headers.insert(name, value);
        }
        Ok(Request {
            method,
            url: descriptor.url.clone(),
            headers,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}\nHEADERS:\n{}", self.method, self.url, format_headers(&self.headers))
    }
}

/// A diagnostic record of one HTTP transaction.  Produced for every call to
/// [`Agent::run`], success or failure, so callers can log what actually
/// went over the wire.
#[derive(Debug, Default, Clone)]
pub struct CallSummary {
    pub method: String,
    pub url: String,
    pub status_code: u16,
    pub status_text: String,
    /// Number of bytes read from the request body.
    pub request_length: u64,
    /// Hex SHA-256 of the request body.
    pub request_sha256: String,
    pub request_headers: HeaderMap,
    /// Number of bytes received on the wire, before any content decoding.
    pub response_length: u64,
    /// Hex SHA-256 of the wire bytes, before any content decoding.
    pub response_sha256: String,
    pub response_headers: HeaderMap,
    /// Whether the response passed integrity verification.
    pub verified: bool,
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or("<binary>"));
        out.push('\n');
    }
    out
}

impl fmt::Display for CallSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verified = if self.verified { " (verified)" } else { "" };
        write!(
            f,
            "Call Summary:\n=============\n{} {}{}\nHTTP Status: {} {}\nRequest Size: {} bytes SHA256: {}\nRequest Headers:\n{}Response Size: {} SHA256: {}\nResponse Headers:\n{}",
            self.method,
            self.url,
            verified,
            self.status_code,
            self.status_text,
            self.request_length,
            self.request_sha256,
            format_headers(&self.request_headers),
            self.response_length,
            self.response_sha256,
            format_headers(&self.response_headers),
        )
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn is_lower_hex_sha256(s: &str) -> bool {
    s.len() == 64
        && s.chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Runs uploads and downloads over a shared connection pool.  Redirects are
/// never followed automatically; the protocol inspects Location itself.
pub(crate) struct Agent {
    client: reqwest::Client,
    logger: Logger,
}

impl Agent {
    pub(crate) fn new(logger: Logger) -> Result<Agent, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Transport {
                context: "building http client".into(),
                source: e,
            })?;
        Ok(Agent { client, logger })
    }

    /// Run a request, hashing and counting the request body and both the
    /// encoded and decoded response body.  The response body is written to
    /// `sink`; for error statuses the server's error document lands there
    /// too.  With `verify`, the measured values are checked against the
    /// `x-amz-meta-*` response headers and any disagreement is a retryable
    /// corruption error.
    ///
    /// The summary is returned in every case.  The error's
    /// [`retryable`](Error::retryable) classification tells the caller
    /// whether a fresh attempt could succeed; this method never retries.
    pub(crate) async fn run(
        &self,
        request: Request,
        body: Option<Box<dyn AsyncRead + Send + Sync + Unpin + 'static>>,
        chunk_size: usize,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
        verify: bool,
    ) -> (CallSummary, Result<(), Error>) {
        let mut cs = CallSummary {
            method: request.method.to_string(),
            url: request.url.clone(),
            request_headers: request.headers.clone(),
            ..CallSummary::default()
        };

        // A caller-supplied Content-Length is authoritative; if it cannot be
        // parsed the request must not be sent at all.
        let declared_length = match request.headers.get(CONTENT_LENGTH) {
            Some(value) => {
                match value
                    .to_str()
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                {
                    Some(n) => Some(n),
                    None => {
                        let err = Error::InvalidArgument(format!(
                            "unparseable Content-Length for {} {}",
                            cs.method, cs.url
                        ));
                        return (cs, Err(err));
                    }
                }
            }
            None => None,
        };

        let request_digest = Arc::new(StreamDigest::new());
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(reader) = body {
            let observed = DigestRead::new(reader, request_digest.clone());
            builder = builder.body(Body::wrap_stream(FramedRead::new(observed, BytesCodec::new())));
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let (sha, len) = request_digest.hex_and_len();
                cs.request_sha256 = sha;
                cs.request_length = len;
                let err = Error::Transport {
                    context: format!("running {} {}", cs.method, cs.url),
                    source: e,
                };
                return (cs, Err(err));
            }
        };

        let (request_sha256, request_length) = request_digest.hex_and_len();
        cs.request_sha256 = request_sha256;
        cs.request_length = request_length;
        cs.status_code = response.status().as_u16();
        cs.status_text = response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        cs.response_headers = response.headers().clone();

        // Sending a different number of bytes than declared means local I/O
        // dropped or invented bytes; treat as transient corruption.
        if let Some(declared) = declared_length {
            if declared != cs.request_length {
                let err = Error::ContentLengthMismatch {
                    declared,
                    sent: cs.request_length,
                };
                return (cs, Err(err));
            }
        }

        if cs.status_code >= 400 {
            let err = Error::Status {
                code: cs.status_code,
                text: cs.status_text.clone(),
            };
            if let Err(drain_err) = drain_to(response, &mut *sink).await {
                warn!(
                    self.logger,
                    "failed draining error response of {} {}: {}", cs.method, cs.url, drain_err
                );
            }
            let class = if err.retryable() {
                "retryable"
            } else {
                "non-retryable"
            };
            warn!(self.logger, "{} error\n{}", class, cs);
            return (cs, Err(err));
        }

        let transfer_digest = Arc::new(StreamDigest::new());
        let wire = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let transfer_reader = DigestRead::new(StreamReader::new(wire), transfer_digest.clone());

        let content_encoding = header_str(&cs.response_headers, CONTENT_ENCODING.as_str())
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let mut decoded: Box<dyn AsyncRead + Send + Unpin> = match content_encoding.as_str() {
            "" | "identity" => Box::new(transfer_reader),
            "gzip" => {
                debug!(
                    self.logger,
                    "resource {} {} is gzip encoded", cs.method, cs.url
                );
                Box::new(GzipDecoder::new(BufReader::new(transfer_reader)))
            }
            other => {
                let err = Error::UnsupportedEncoding(other.to_string());
                return (cs, Err(err));
            }
        };

        let mut content_hash = Sha256::new();
        let mut content_length: u64 = 0;
        let mut buf = vec![0u8; chunk_size];
        loop {
            let n = match decoded.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let (sha, len) = transfer_digest.hex_and_len();
                    cs.response_sha256 = sha;
                    cs.response_length = len;
                    let err = Error::io(
                        format!("reading response body of {} {}", cs.method, cs.url),
                        e,
                    );
                    return (cs, Err(err));
                }
            };
            if n == 0 {
                break;
            }
            content_hash.update(&buf[..n]);
            content_length += n as u64;
            if let Err(e) = sink.write_all(&buf[..n]).await {
                let (sha, len) = transfer_digest.hex_and_len();
                cs.response_sha256 = sha;
                cs.response_length = len;
                let err = Error::io(
                    format!("writing response body of {} {}", cs.method, cs.url),
                    e,
                );
                return (cs, Err(err));
            }
        }
        if let Err(e) = sink.flush().await {
            let err = Error::io(format!("flushing output of {} {}", cs.method, cs.url), e);
            return (cs, Err(err));
        }

        let content_sha256 = hex(&content_hash.finalize());
        let (transfer_sha256, transfer_length) = transfer_digest.hex_and_len();
        cs.response_length = transfer_length;
        cs.response_sha256 = transfer_sha256.clone();

        if verify {
            // Find every way the response is invalid, not just the first,
            // so one round of logs shows all the flaws.
            let mut valid = true;

            let mut expected_length: u64 = 0;
            match header_str(&cs.response_headers, "x-amz-meta-content-length") {
                None => {
                    warn!(
                        self.logger,
                        "expected header x-amz-meta-content-length to have a value"
                    );
                    valid = false;
                }
                Some(value) => match value.parse::<u64>() {
                    Ok(n) => expected_length = n,
                    Err(_) => {
                        warn!(
                            self.logger,
                            "unparseable x-amz-meta-content-length {} for {} {}",
                            value,
                            cs.method,
                            cs.url
                        );
                        return (cs, Err(Error::Corrupt));
                    }
                },
            }

            let expected_transfer_length =
                match header_str(&cs.response_headers, "x-amz-meta-transfer-length") {
                    None => expected_length,
                    Some(value) => match value.parse::<u64>() {
                        Ok(n) => n,
                        Err(_) => {
                            warn!(
                                self.logger,
                                "unparseable x-amz-meta-transfer-length {} for {} {}",
                                value,
                                cs.method,
                                cs.url
                            );
                            return (cs, Err(Error::Corrupt));
                        }
                    },
                };

            let expected_sha256 =
                match header_str(&cs.response_headers, "x-amz-meta-content-sha256") {
                    None => {
                        warn!(
                            self.logger,
                            "expected header x-amz-meta-content-sha256 to have a value"
                        );
                        valid = false;
                        String::new()
                    }
                    Some(value) => {
                        if !is_lower_hex_sha256(&value) {
                            warn!(
                                self.logger,
                                "expected x-amz-meta-content-sha256 to be 64 lowercase hex chars, got {}",
                                value
                            );
                            valid = false;
                        }
                        value
                    }
                };

            let expected_transfer_sha256 =
                match header_str(&cs.response_headers, "x-amz-meta-transfer-sha256") {
                    None => expected_sha256.clone(),
                    Some(value) => value,
                };

            if expected_transfer_length != transfer_length {
                warn!(
                    self.logger,
                    "resource {} {} has incorrect transfer length. expected: {} received: {}",
                    cs.method,
                    cs.url,
                    expected_transfer_length,
                    transfer_length
                );
                valid = false;
            }
            if expected_transfer_sha256 != transfer_sha256 {
                warn!(
                    self.logger,
                    "resource {} {} has incorrect transfer sha256. expected: {} received: {}",
                    cs.method,
                    cs.url,
                    expected_transfer_sha256,
                    transfer_sha256
                );
                valid = false;
            }
            if expected_length != content_length {
                warn!(
                    self.logger,
                    "resource {} {} has incorrect content length. expected: {} received: {}",
                    cs.method,
                    cs.url,
                    expected_length,
                    content_length
                );
                valid = false;
            }
            if expected_sha256 != content_sha256 {
                warn!(
                    self.logger,
                    "resource {} {} has incorrect content sha256. expected: {} received: {}",
                    cs.method,
                    cs.url,
                    expected_sha256,
                    content_sha256
                );
                valid = false;
            }

            if !valid {
                warn!(
                    self.logger,
                    "response {} {} is INVALID. received: transfer: {} {} bytes content: {} {} bytes",
                    cs.method,
                    cs.url,
                    &transfer_sha256[..7],
                    transfer_length,
                    &content_sha256[..7],
                    content_length
                );
                // invalid artifacts may be corruption over the wire, which a
                // fresh copy can clear up
                return (cs, Err(Error::Corrupt));
            }
            cs.verified = true;
            debug!(
                self.logger,
                "response {} {} is valid. transfer: {} {} bytes content: {} {} bytes",
                cs.method,
                cs.url,
                &transfer_sha256[..7],
                transfer_length,
                &content_sha256[..7],
                content_length
            );
        } else {
            debug!(
                self.logger,
                "response {} {} is complete. transfer: {} {} bytes content: {} {} bytes",
                cs.method,
                cs.url,
                &transfer_sha256[..7],
                transfer_length,
                &content_sha256[..7],
                content_length
            );
        }

        (cs, Ok(()))
    }
}

/// Copy the remainder of a response body into the sink.
async fn drain_to(
    response: reqwest::Response,
    sink: &mut (dyn AsyncWrite + Send + Unpin),
) -> std::io::Result<u64> {
    let stream = response
        .bytes_stream()
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut reader = StreamReader::new(stream);
    let copied = tokio::io::copy(&mut reader, sink).await?;
    sink.flush().await?;
    Ok(copied)
}
