//! Typed errors for artifact transfers.
//!
//! Every failure carries a classification of whether a fresh attempt might
//! succeed ([`Error::retryable`]).  The library itself never retries; callers
//! that want a retry policy can layer one on top of the classification
//! without inspecting message strings.

use std::fmt::Write as _;
use thiserror::Error;

/// Result type alias for artifact operations.
pub type Result<T> = std::result::Result<T, Error>;

/// An error from an upload, download, or preparation operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Transferred data disagreed with its integrity metadata.  The next
    /// attempt may receive a clean copy, so this is retryable.
    #[error("corrupt resource")]
    Corrupt,

    /// The requested artifact was stored as an error artifact.  Whatever
    /// should have produced the artifact failed and recorded this in its
    /// stead; the error document has been written to the output.
    #[error("artifact is an error artifact")]
    ErrorArtifact,

    /// A redirect was received with a missing or unparseable Location.
    #[error("malformed redirect")]
    BadRedirect,

    /// A redirect was received where none was expected.
    #[error("unexpected redirect")]
    UnexpectedRedirect,

    /// A redirect was expected but not received.
    #[error("expected redirect")]
    ExpectedRedirect,

    /// A redirect pointed at a non-https resource and insecure resources
    /// were not allowed.
    #[error("only resources served over https are allowed")]
    HttpsRequired,

    /// The response declared a Content-Encoding this library does not
    /// implement.
    #[error("unsupported content-encoding {0}")]
    UnsupportedEncoding(String),

    /// A caller-supplied argument was invalid (bad part or chunk size,
    /// zero-size bounded stream, malformed header).
    #[error("{0}")]
    InvalidArgument(String),

    /// An output writer or staging stream which had to be empty was not.
    #[error("output writer is not empty")]
    BadOutputWriter,

    /// The number of bytes read from the request body did not match the
    /// declared Content-Length.  Local I/O may have dropped bytes, so this
    /// is retryable.
    #[error("sent {sent} bytes for a declared content-length of {declared}")]
    ContentLengthMismatch { declared: u64, sent: u64 },

    /// The server answered with an error status.  5xx responses are
    /// retryable, 4xx responses are not.
    #[error("received {code} {text}")]
    Status { code: u16, text: String },

    /// The HTTP transport failed before a response arrived.
    #[error("{context}")]
    Transport {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// Local or transport I/O failed mid-stream.  Treated as transient.
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote side violated the protocol (unparseable JSON, wrong
    /// request count, staging mutated between passes).
    #[error("{0}")]
    Protocol(String),

    /// The surrounding context canceled the operation.
    #[error("operation canceled")]
    Canceled,
}

impl Error {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether a fresh attempt might succeed.  Server 5xx responses, local
    /// I/O failures, and wire corruption are transient; everything else is
    /// permanent.
    pub fn retryable(&self) -> bool {
        match self {
            Error::Corrupt | Error::ContentLengthMismatch { .. } | Error::Io { .. } => true,
            Error::Status { code, .. } => *code >= 500,
            _ => false,
        }
    }

    /// Render the cause chain, one numbered line per node.  HTTP transport
    /// nodes print the URL they failed against; other nodes keep their own
    /// message.
    pub fn error_chain(&self) -> String {
        let mut out = String::new();
        let mut node: Option<&(dyn std::error::Error + 'static)> = Some(self);
        let mut i = 1;
        while let Some(err) = node {
            if let Some(request_err) = err.downcast_ref::<reqwest::Error>() {
                match request_err.url() {
                    Some(url) => {
                        let _ = write!(out, "\n  {}. (http) FAIL {}", i, url);
                    }
                    None => {
                        let _ = write!(out, "\n  {}. (http) {}", i, request_err);
                    }
                }
            } else {
                let _ = write!(out, "\n  {}. {}", i, err);
            }
            node = err.source();
            i += 1;
        }
        out
    }
}
