use crate::error::{ParseErrorKind, Result, RtspError};

/// Default `User-Agent` reported when a request omits the header (§4.1).
pub const DEFAULT_USER_AGENT: &str = "unknown user agent";

/// A parsed RTSP request (RFC 2326 §6).
///
/// RTSP requests follow HTTP/1.1 syntax:
///
/// ```text
/// Method SP Request-URI SP RTSP-Version CRLF
/// *(Header: Value CRLF)
/// CRLF
/// ```
///
/// None of OPTIONS/DESCRIBE/SETUP/PLAY/TEARDOWN carry a request body, so
/// unlike [`super::reply::RtspReply`] this type doesn't parse one.
///
/// Header lookup is case-insensitive per RFC 2326 §4.2.
#[derive(Debug)]
pub struct RtspRequest {
    /// RTSP method (OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, ...).
    pub method: String,
    /// Request-URI (e.g. `rtsp://host:port/camera-hash`).
    pub uri: String,
    /// Protocol version (expected: `RTSP/1.0`).
    pub version: String,
    /// Headers as ordered (name, value) pairs. Names are stored as-received;
    /// lookups via [`get_header`](Self::get_header) are case-insensitive.
    pub headers: Vec<(String, String)>,
}

impl RtspRequest {
    /// Parse an RTSP request from its text representation.
    ///
    /// Expects a complete request: request line, headers, and trailing blank
    /// line. `CSeq` is required; its absence is a parse error (§4.1 edge
    /// cases). Returns [`RtspError::Parse`] on malformed input.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines();

        let request_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidRequestLine,
            });
        }

        let method = parts[0].to_string();
        let uri = parts[1].to_string();
        let version = parts[2].to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }

            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;

            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();
            headers.push((name, value));
        }

        let request = RtspRequest {
            method,
            uri,
            version,
            headers,
        };

        if request.cseq().is_none() {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::MissingHeader("CSeq"),
            });
        }

        Ok(request)
    }

    /// Look up a header value by name (case-insensitive, per RFC 2326 §4.2).
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns the parsed `CSeq` value (RFC 2326 §12.17), numbering and
    /// ordering RTSP request/response pairs.
    pub fn cseq(&self) -> Option<u64> {
        self.get_header("CSeq")?.trim().parse().ok()
    }

    /// `Session` header value, with any `;timeout=...` suffix stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }

    /// `User-Agent`, defaulting to [`DEFAULT_USER_AGENT`] when absent.
    pub fn user_agent(&self) -> &str {
        self.get_header("User-Agent").unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Raw `Transport` header value, if present.
    pub fn transport(&self) -> Option<&str> {
        self.get_header("Transport")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://localhost:8554/test RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "OPTIONS");
        assert_eq!(req.uri, "rtsp://localhost:8554/test");
        assert_eq!(req.version, "RTSP/1.0");
        assert_eq!(req.cseq(), Some(1));
    }

    #[test]
    fn parse_setup_with_transport() {
        let raw = "SETUP rtsp://localhost:8554/test/track1 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq(), Some(3));
        assert_eq!(
            req.transport(),
            Some("RTP/AVP;unicast;client_port=8000-8001")
        );
    }

    #[test]
    fn parse_empty_request() {
        assert!(RtspRequest::parse("").is_err());
    }

    #[test]
    fn parse_invalid_request_line() {
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
    }

    #[test]
    fn missing_cseq_is_an_error() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\n\r\n";
        assert!(RtspRequest::parse(raw).is_err());
    }

    #[test]
    fn header_lookup_case_insensitive() {
        let raw = "OPTIONS rtsp://localhost RTSP/1.0\r\ncseq: 42\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.get_header("CSeq"), Some("42"));
        assert_eq!(req.get_header("cseq"), Some("42"));
        assert_eq!(req.get_header("CSEQ"), Some("42"));
    }

    #[test]
    fn session_id_strips_timeout_suffix() {
        let raw = "PLAY rtsp://h/p RTSP/1.0\r\nCSeq: 1\r\nSession: abc123;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.session_id(), Some("abc123"));
    }

    #[test]
    fn user_agent_defaults_when_absent() {
        let raw = "OPTIONS rtsp://h/p RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.user_agent(), DEFAULT_USER_AGENT);
    }
}
