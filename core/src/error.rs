//! Error types for the RTSP proxy.

use std::fmt;

/// Errors that can occur anywhere in the proxy.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures.
/// - **URL**: [`InvalidUrl`](Self::InvalidUrl) — malformed camera URL.
/// - **Upstream**: [`UpstreamConnect`](Self::UpstreamConnect),
///   [`UpstreamProtocol`](Self::UpstreamProtocol),
///   [`UpstreamTimeout`](Self::UpstreamTimeout),
///   [`DigestRetryExhausted`](Self::DigestRetryExhausted).
/// - **Registry**: [`UnknownCamera`](Self::UnknownCamera).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning).
#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request/reply message (RFC 2326 §6, §7).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// The configured or requested camera URL doesn't match
    /// `scheme://[login[:pass]@]host[:port][/path]`.
    #[error("invalid camera url: {0}")]
    InvalidUrl(String),

    /// No camera is registered under this hash.
    #[error("unknown camera hash: {0}")]
    UnknownCamera(String),

    /// TCP connect to the camera's host:port failed.
    #[error("can't connect to upstream camera [{hash}]: {source}")]
    UpstreamConnect {
        hash: String,
        #[source]
        source: std::io::Error,
    },

    /// Camera replied with a non-2xx status where 2xx was required (SETUP/PLAY),
    /// or sent a reply the codec couldn't make sense of (empty body, missing header).
    #[error("upstream protocol error [{hash}]: {reason}")]
    UpstreamProtocol { hash: String, reason: String },

    /// Camera required Digest auth and rejected the authenticated retry too.
    #[error("upstream digest auth failed [{hash}]: camera rejected the authenticated retry")]
    DigestRetryExhausted { hash: String },

    /// Camera did not reply within the configured request timeout.
    #[error("upstream request timed out [{hash}]")]
    UpstreamTimeout { hash: String },

    /// [`Server::start`](crate::server::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request/status line).
    EmptyMessage,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// Status line did not have the expected `RTSP/1.0 code reason` format.
    InvalidStatusLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// A required header (e.g. `CSeq`) was absent.
    MissingHeader(&'static str),
    /// A header value could not be parsed into the expected shape
    /// (e.g. `Transport` without `client_port=`, non-numeric `CSeq`).
    InvalidHeaderValue(&'static str),
    /// The SDP body had no usable media section.
    InvalidSdp(&'static str),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidStatusLine => write!(f, "invalid status line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MissingHeader(name) => write!(f, "missing header: {name}"),
            Self::InvalidHeaderValue(name) => write!(f, "invalid value for header: {name}"),
            Self::InvalidSdp(reason) => write!(f, "invalid sdp: {reason}"),
        }
    }
}

/// Convenience alias for `Result<T, RtspError>`.
pub type Result<T> = std::result::Result<T, RtspError>;
