//! Parsing of RTSP replies received *from* an upstream camera (RFC 2326 §7).
//!
//! This is the mirror image of [`super::request::RtspRequest`]: where that
//! type parses what viewers send us, [`RtspReply`] parses what the camera
//! sends back. Unlike requests, replies frequently carry a body (SDP on a
//! DESCRIBE 200, nothing on SETUP/PLAY/OPTIONS), so a `Content-Length`-aware
//! body split is needed here.

use crate::error::{ParseErrorKind, Result, RtspError};

/// A parsed RTSP reply: `RTSP/1.0 <code> <reason>` plus headers and an
/// optional body.
#[derive(Debug)]
pub struct RtspReply {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl RtspReply {
    /// Parse a complete reply, including its body if `Content-Length`
    /// indicates one follows the header block.
    pub fn parse(raw: &str) -> Result<Self> {
        let header_end = raw.find("\r\n\r\n").map(|p| (p, 4)).or_else(|| raw.find("\n\n").map(|p| (p, 2)));
        let (head, body) = match header_end {
            Some((pos, sep_len)) => (&raw[..pos], Some(raw[pos + sep_len..].to_string())),
            None => (raw, None),
        };

        let mut lines = head.lines();
        let status_line = lines.next().ok_or(RtspError::Parse {
            kind: ParseErrorKind::EmptyMessage,
        })?;

        let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
        if parts.len() != 3 || !parts[0].starts_with("RTSP/") {
            return Err(RtspError::Parse {
                kind: ParseErrorKind::InvalidStatusLine,
            });
        }

        let status_code: u16 = parts[1].parse().map_err(|_| RtspError::Parse {
            kind: ParseErrorKind::InvalidStatusLine,
        })?;
        let status_text = parts[2].trim().to_string();

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let colon_pos = line.find(':').ok_or(RtspError::Parse {
                kind: ParseErrorKind::InvalidHeader,
            })?;
            headers.push((
                line[..colon_pos].trim().to_string(),
                line[colon_pos + 1..].trim().to_string(),
            ));
        }

        let reply = RtspReply {
            status_code,
            status_text,
            headers,
            body,
        };

        // Trim the body down to Content-Length, in case more than one reply
        // arrived in the same read (GET_PARAMETER keepalives can pipeline).
        let reply = match reply.content_length() {
            Some(len) => {
                let trimmed = reply.body.as_ref().map(|b| {
                    let len = len.min(b.len());
                    b[..len].to_string()
                });
                RtspReply { body: trimmed, ..reply }
            }
            None => RtspReply { body: None, ..reply },
        };

        Ok(reply)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn cseq(&self) -> Option<u64> {
        self.get_header("CSeq")?.trim().parse().ok()
    }

    pub fn content_length(&self) -> Option<usize> {
        self.get_header("Content-Length")?.trim().parse().ok()
    }

    /// `WWW-Authenticate` header value, present on a 401 challenge.
    pub fn www_authenticate(&self) -> Option<&str> {
        self.get_header("WWW-Authenticate")
    }

    /// `Session` header value, with any `;timeout=...` suffix stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.get_header("Session")
            .map(|s| s.split(';').next().unwrap_or(s).trim())
    }

    /// Raw `Transport` header value, echoed back by the camera on a SETUP 200.
    pub fn transport(&self) -> Option<&str> {
        self.get_header("Transport")
    }

    /// `RTP-Info` header value, present on a PLAY 200 (RFC 2326 §12.33).
    pub fn rtp_info(&self) -> Option<&str> {
        self.get_header("RTP-Info")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status_code == 401
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_reply() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: OPTIONS, DESCRIBE\r\n\r\n";
        let reply = RtspReply::parse(raw).unwrap();
        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.status_text, "OK");
        assert_eq!(reply.cseq(), Some(1));
        assert!(reply.is_success());
        assert!(reply.body.is_none());
    }

    #[test]
    fn parse_describe_reply_with_sdp_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 5\r\n\r\nv=0\r\ngarbage-after";
        let reply = RtspReply::parse(raw).unwrap();
        assert_eq!(reply.body.as_deref(), Some("v=0\r\n"));
    }

    #[test]
    fn parse_401_challenge() {
        let raw = "RTSP/1.0 401 Unauthorized\r\nCSeq: 1\r\nWWW-Authenticate: Digest realm=\"CAM\", nonce=\"abc\"\r\n\r\n";
        let reply = RtspReply::parse(raw).unwrap();
        assert!(reply.is_unauthorized());
        assert_eq!(
            reply.www_authenticate(),
            Some(r#"Digest realm="CAM", nonce="abc""#)
        );
    }

    #[test]
    fn parse_setup_reply_with_transport_and_session() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 123456;timeout=60\r\nTransport: RTP/AVP;unicast;client_port=8000-8001;server_port=9000-9001\r\n\r\n";
        let reply = RtspReply::parse(raw).unwrap();
        assert_eq!(reply.session_id(), Some("123456"));
        assert!(reply.transport().unwrap().contains("server_port=9000-9001"));
    }

    #[test]
    fn rejects_invalid_status_line() {
        assert!(RtspReply::parse("not a status line\r\n\r\n").is_err());
    }

    #[test]
    fn reply_without_trailing_blank_line_has_no_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 1\r\n";
        let reply = RtspReply::parse(raw).unwrap();
        assert!(reply.body.is_none());
    }
}
