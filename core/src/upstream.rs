//! The upstream camera session (§3 Upstream Session, §4.4 state machine).
//!
//! One [`Upstream`] exists per camera hash while at least one subscriber is
//! attached. It owns the RTSP control connection to the camera: OPTIONS,
//! DESCRIBE (with a single 401→Digest retry), SETUP for each track, and
//! PLAY. The actual RTP/RTCP byte relay lives in [`crate::transport`]; this
//! module only negotiates the control channel and hands back what fan-out
//! needs (the SDP, the track control ids, the transport details, RTP-Info).

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::digest;
use crate::error::{RtspError, Result};
use crate::protocol::reply::RtspReply;
use crate::protocol::sdp::{self, Description};
use crate::protocol::transport_header;
use crate::url::UrlParts;

/// Per-track RTP-Info captured off the camera's PLAY 200, used to rewrite
/// timestamps for subscribers that join later (§4.5).
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackRtpInfo {
    pub seq: u32,
    pub rtptime: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpstreamState {
    Idle,
    Connected,
    Described,
    SetupA,
    SetupAb,
    Playing,
    Closed,
}

/// A live (or freshly negotiated) connection to one upstream camera.
pub struct Upstream {
    pub camera_hash: String,
    pub url: UrlParts,
    pub tcp_mode: bool,
    pub udp_ports: [u16; 4],
    pub description: Description,
    pub track_control_ids: Vec<String>,
    /// Interleaved channel pairs actually negotiated, one per track.
    pub channels: Vec<(u8, u8)>,
    pub rtp_info: Vec<TrackRtpInfo>,
    pub start_wall_time: Option<Instant>,

    state: UpstreamState,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    cseq: u64,
    session_id: Option<String>,
    challenge: Option<(String, String)>,
    timeout: Duration,
}

impl Upstream {
    /// Connect to the camera and negotiate through PLAY-readiness: OPTIONS,
    /// DESCRIBE (with Digest retry on 401), and SETUP for every track the
    /// SDP advertises. Does not send PLAY — that happens lazily, from the
    /// first subscriber that reaches PLAY (§4.4).
    pub fn open(camera_hash: &str, config: &Config, camera_index: usize) -> Result<Self> {
        let url = config
            .camera_url(camera_hash)
            .ok_or_else(|| RtspError::UnknownCamera(camera_hash.to_string()))?;
        let url = UrlParts::parse(url)?;

        let addr = format!("{}:{}", url.host, url.port);
        let stream = TcpStream::connect(&addr).map_err(|source| RtspError::UpstreamConnect {
            hash: camera_hash.to_string(),
            source,
        })?;
        stream.set_read_timeout(Some(config.upstream_timeout))?;
        stream.set_write_timeout(Some(config.upstream_timeout))?;
        let reader = BufReader::new(stream.try_clone()?);

        let mut upstream = Upstream {
            camera_hash: camera_hash.to_string(),
            url,
            tcp_mode: config.tcp_mode,
            udp_ports: config.udp_ports_for_index(camera_index),
            description: Description::default(),
            track_control_ids: Vec::new(),
            channels: Vec::new(),
            rtp_info: Vec::new(),
            start_wall_time: None,
            state: UpstreamState::Idle,
            stream,
            reader,
            cseq: 1,
            session_id: None,
            challenge: None,
            timeout: config.upstream_timeout,
        };

        upstream.negotiate()?;
        Ok(upstream)
    }

    fn negotiate(&mut self) -> Result<()> {
        self.send_options()?;
        self.state = UpstreamState::Connected;

        self.send_describe()?;
        self.state = UpstreamState::Described;

        let tracks = self.track_control_ids.len();
        self.send_setup(0)?;
        self.state = UpstreamState::SetupA;

        if tracks > 1 {
            self.send_setup(1)?;
            self.state = UpstreamState::SetupAb;
        }

        Ok(())
    }

    fn send_options(&mut self) -> Result<()> {
        let reply = self.roundtrip("OPTIONS", &self.url.canonical(), &[], None)?;
        if !reply.is_success() {
            return Err(RtspError::UpstreamProtocol {
                hash: self.camera_hash.clone(),
                reason: format!("OPTIONS rejected: {} {}", reply.status_code, reply.status_text),
            });
        }
        Ok(())
    }

    fn send_describe(&mut self) -> Result<()> {
        let uri = self.url.canonical();
        let headers = [("Accept".to_string(), "application/sdp".to_string())];

        let mut reply = self.roundtrip("DESCRIBE", &uri, &headers, None)?;

        if reply.is_unauthorized() {
            let challenge = reply
                .www_authenticate()
                .and_then(digest::parse_www_authenticate)
                .ok_or_else(|| RtspError::UpstreamProtocol {
                    hash: self.camera_hash.clone(),
                    reason: "401 without a parseable WWW-Authenticate".to_string(),
                })?;
            self.challenge = Some(challenge);

            let auth_headers = [self.authorization_header("DESCRIBE", &uri)];
            reply = self.roundtrip("DESCRIBE", &uri, &auth_headers, None)?;

            if reply.is_unauthorized() {
                return Err(RtspError::DigestRetryExhausted {
                    hash: self.camera_hash.clone(),
                });
            }
        }

        if !reply.is_success() {
            return Err(RtspError::UpstreamProtocol {
                hash: self.camera_hash.clone(),
                reason: format!("DESCRIBE rejected: {} {}", reply.status_code, reply.status_text),
            });
        }

        let body = reply.body.as_deref().ok_or_else(|| RtspError::UpstreamProtocol {
            hash: self.camera_hash.clone(),
            reason: "DESCRIBE 200 with no SDP body".to_string(),
        })?;

        self.description = sdp::parse(body)?;
        self.track_control_ids = sdp::extract_track_control_ids(body)?;
        Ok(())
    }

    fn send_setup(&mut self, track_index: usize) -> Result<()> {
        let control_id = &self.track_control_ids[track_index];
        let uri = format!("{}/{}", self.url.canonical(), control_id);

        let transport = if self.tcp_mode {
            let lo = (track_index * 2) as u8;
            transport_header::client_request_interleaved(lo, lo + 1)
        } else {
            let base = self.udp_ports[track_index * 2];
            transport_header::client_request(base, base + 1)
        };

        let mut headers = vec![("Transport".to_string(), transport)];
        if let Some(session) = &self.session_id
            && track_index > 0
        {
            // Per source behavior (§9 Design Notes): Session is only carried
            // on the second and later SETUPs, not the first.
            headers.push(("Session".to_string(), session.clone()));
        }

        if self.challenge.is_some() {
            let canonical = self.url.canonical();
            headers.push(self.authorization_header("SETUP", &canonical));
        }

        let reply = self.roundtrip("SETUP", &uri, &headers, None)?;
        if !reply.is_success() {
            return Err(RtspError::UpstreamProtocol {
                hash: self.camera_hash.clone(),
                reason: format!("SETUP rejected: {} {}", reply.status_code, reply.status_text),
            });
        }

        if self.session_id.is_none()
            && let Some(session) = reply.session_id()
        {
            self.session_id = Some(session.to_string());
        }

        match reply.transport().and_then(transport_header::parse) {
            Some(transport_header::TransportMode::TcpInterleaved { channel_lo, channel_hi }) => {
                self.channels.push((channel_lo, channel_hi));
            }
            _ => self.channels.push(((track_index * 2) as u8, (track_index * 2 + 1) as u8)),
        }

        Ok(())
    }

    /// Send PLAY and capture RTP-Info. Idempotent: a second call while
    /// already `Playing` is a no-op (multiple subscribers racing to be
    /// "first to PLAY" only pay for one PLAY round-trip).
    pub fn play(&mut self) -> Result<()> {
        if self.state == UpstreamState::Playing {
            return Ok(());
        }

        let uri = self.url.canonical();
        let mut headers = vec![("Range".to_string(), "npt=0.000-".to_string())];
        if let Some(session) = self.session_id.clone() {
            headers.push(("Session".to_string(), session));
        }
        if self.challenge.is_some() {
            headers.push(self.authorization_header("PLAY", &uri));
        }

        let reply = self.roundtrip("PLAY", &uri, &headers, None)?;
        if !reply.is_success() {
            return Err(RtspError::UpstreamProtocol {
                hash: self.camera_hash.clone(),
                reason: format!("PLAY rejected: {} {}", reply.status_code, reply.status_text),
            });
        }

        self.rtp_info = reply
            .rtp_info()
            .map(parse_rtp_info)
            .unwrap_or_default();
        self.start_wall_time = Some(Instant::now());
        self.state = UpstreamState::Playing;
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.state == UpstreamState::Playing
    }

    /// A clone of the control-connection socket for the TCP interleaved
    /// fan-out loop to read media frames from.
    pub fn media_stream(&self) -> Result<TcpStream> {
        Ok(self.stream.try_clone()?)
    }

    fn authorization_header(&self, method: &str, uri: &str) -> (String, String) {
        let (realm, nonce) = self.challenge.as_ref().expect("challenge must be set before building Authorization");
        let response = digest::compute_response(&self.url.login, realm, &self.url.password, method, uri, nonce);
        let line = digest::authorization_header(&self.url.login, realm, nonce, uri, &response);
        let (name, value) = line.split_once(": ").expect("authorization_header always emits a colon-space");
        (name.to_string(), value.to_string())
    }

    fn roundtrip(
        &mut self,
        method: &str,
        uri: &str,
        extra_headers: &[(String, String)],
        body: Option<&str>,
    ) -> Result<RtspReply> {
        let cseq = self.cseq;
        self.cseq += 1;

        let mut request = format!("{method} {uri} RTSP/1.0\r\nCSeq: {cseq}\r\n");
        for (name, value) in extra_headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str("\r\n");
        if let Some(body) = body {
            request.push_str(body);
        }

        self.stream.write_all(request.as_bytes())?;

        read_reply(&mut self.reader, self.timeout, &self.camera_hash)
    }
}

/// Read one complete RTSP reply: headers up to the blank line, then a body
/// sized by `Content-Length` if present.
fn read_reply(reader: &mut BufReader<TcpStream>, timeout: Duration, hash: &str) -> Result<RtspReply> {
    reader.get_ref().set_read_timeout(Some(timeout))?;

    let timed_out = |e: &std::io::Error| {
        matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
    };

    let mut head = Vec::new();
    let mut prev_four = [0u8; 4];
    loop {
        let mut byte = [0u8; 1];
        let n = match reader.read(&mut byte) {
            Ok(n) => n,
            Err(e) if timed_out(&e) => {
                return Err(RtspError::UpstreamTimeout {
                    hash: hash.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(RtspError::UpstreamProtocol {
                hash: hash.to_string(),
                reason: "connection closed while waiting for a reply".to_string(),
            });
        }
        head.push(byte[0]);
        prev_four.rotate_left(1);
        prev_four[3] = byte[0];
        if &prev_four == b"\r\n\r\n" {
            break;
        }
    }

    let head_text = String::from_utf8_lossy(&head).to_string();
    let content_length = head_text
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().to_string()))
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut full = head_text;
    if content_length > 0 {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).map_err(|e| {
            if timed_out(&e) {
                RtspError::UpstreamTimeout { hash: hash.to_string() }
            } else {
                RtspError::Io(e)
            }
        })?;
        full.push_str(&String::from_utf8_lossy(&body));
    }

    RtspReply::parse(&full)
}

/// Parse an `RTP-Info` header value into per-track seq/rtptime pairs, in
/// the order tracks appear (§4.5).
fn parse_rtp_info(value: &str) -> Vec<TrackRtpInfo> {
    value
        .split(',')
        .map(|entry| {
            let seq = entry
                .split(';')
                .find_map(|p| p.trim().strip_prefix("seq="))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let rtptime = entry
                .split(';')
                .find_map(|p| p.trim().strip_prefix("rtptime="))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            TrackRtpInfo { seq, rtptime }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_track_rtp_info() {
        let info = parse_rtp_info("url=rtsp://h/track1;seq=100;rtptime=5000");
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].seq, 100);
        assert_eq!(info[0].rtptime, 5000);
    }

    #[test]
    fn parses_two_track_rtp_info() {
        let info = parse_rtp_info(
            "url=rtsp://h/track1;seq=100;rtptime=5000,url=rtsp://h/track2;seq=7;rtptime=900",
        );
        assert_eq!(info.len(), 2);
        assert_eq!(info[1].seq, 7);
        assert_eq!(info[1].rtptime, 900);
    }
}
