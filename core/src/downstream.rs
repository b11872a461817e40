//! Per-viewer RTSP connection: method dispatch and the downstream state
//! machine (§4.5, §3 Subscriber lifecycle).

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;

use crate::config::Config;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::transport_header::{self, TransportMode};
use crate::protocol::sdp;
use crate::registry::Registry;
use crate::subscriber::{Subscriber, SubscriberMedia, UdpClientPorts};
use crate::transport;
use crate::url::percent_decode;

const SESSION_ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_ID_LEN: usize = 9;
/// Upper bound on a single request's header block (§4.5: reads up to 2048
/// bytes at a time; a handful of headers comfortably fits several reads).
const MAX_REQUEST_BYTES: usize = 8192;

/// Handle one viewer's RTSP connection end to end. Runs on its own thread,
/// spawned by [`crate::transport::tcp::accept_loop`].
pub fn handle(stream: TcpStream, peer_addr: SocketAddr, config: Arc<Config>, registry: Arc<Registry>) {
    let reader_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };
    let control_socket = Arc::new(Mutex::new(stream));

    let mut conn = Connection {
        reader: BufReader::new(reader_stream),
        control_socket,
        peer_addr,
        config,
        registry,
        camera_hash: None,
        session_id: None,
        transport_mode: None,
        udp_client_ports: Vec::new(),
        tcp_channels: Vec::new(),
        setup_tracks: 0,
        user_agent: String::new(),
        subscribed: false,
    };

    tracing::info!(peer = %peer_addr, "viewer connected");
    let reason = conn.run();
    conn.cleanup();
    tracing::info!(peer = %peer_addr, reason, "viewer disconnected");
}

struct Connection {
    reader: BufReader<TcpStream>,
    control_socket: Arc<Mutex<TcpStream>>,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    registry: Arc<Registry>,
    camera_hash: Option<String>,
    session_id: Option<String>,
    transport_mode: Option<TransportMode>,
    udp_client_ports: Vec<UdpClientPorts>,
    tcp_channels: Vec<(u8, u8)>,
    setup_tracks: usize,
    user_agent: String,
    subscribed: bool,
}

impl Connection {
    fn run(&mut self) -> &'static str {
        loop {
            let request_text = match self.read_one_request() {
                Ok(Some(text)) => text,
                Ok(None) => return "connection closed by peer",
                Err(()) => return "read error",
            };

            if request_text.trim().is_empty() {
                continue;
            }

            let request = match RtspRequest::parse(&request_text) {
                Ok(request) => request,
                Err(e) => {
                    tracing::warn!(peer = %self.peer_addr, error = %e, "parse error, closing connection");
                    return "malformed request";
                }
            };

            tracing::debug!(peer = %self.peer_addr, method = %request.method, uri = %request.uri, "request");

            match self.handle_request(&request) {
                Some(response) => {
                    let wrote = self
                        .control_socket
                        .lock()
                        .write_all(response.serialize().as_bytes());
                    if wrote.is_err() {
                        return "write error";
                    }

                    if request.method == "PLAY" && self.transport_mode_is_tcp() {
                        // Media now flows over this same socket via the
                        // fan-out thread (§4.5); stop competing for reads.
                        return "switched to media-only TCP interleave";
                    }
                }
                None => return "closing connection (unknown camera or upstream failure)",
            }
        }
    }

    fn transport_mode_is_tcp(&self) -> bool {
        matches!(self.transport_mode, Some(TransportMode::TcpInterleaved { .. }))
    }

    /// Read one RTSP request: lines up to and including the terminating
    /// blank line. Returns `Ok(None)` on a clean EOF between requests.
    fn read_one_request(&mut self) -> Result<Option<String>, ()> {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            match self.reader.read_line(&mut line) {
                Ok(0) if text.is_empty() => return Ok(None),
                Ok(0) => return Err(()),
                Ok(_) => {
                    text.push_str(&line);
                    if text.len() > MAX_REQUEST_BYTES {
                        return Err(());
                    }
                    if line == "\r\n" || line == "\n" {
                        return Ok(Some(text));
                    }
                }
                Err(_) => return Err(()),
            }
        }
    }

    fn handle_request(&mut self, request: &RtspRequest) -> Option<RtspResponse> {
        self.user_agent = request.user_agent().to_string();
        let cseq = request.cseq().unwrap_or(0);

        if self.camera_hash.is_none() {
            let hash = extract_camera_hash(&request.uri)?;
            if !self.registry.contains(&hash) {
                tracing::warn!(peer = %self.peer_addr, camera_hash = %hash, "unknown camera hash");
                return None;
            }
            self.camera_hash = Some(hash);
        }
        let camera_hash = self.camera_hash.clone().expect("just set above");

        match request.method.as_str() {
            "OPTIONS" => Some(self.handle_options(cseq)),
            "DESCRIBE" => self.handle_describe(cseq, &camera_hash),
            "SETUP" => self.handle_setup(request, cseq, &camera_hash),
            "PLAY" => self.handle_play(cseq, &camera_hash),
            "TEARDOWN" => Some(self.handle_teardown(cseq, &camera_hash)),
            other => {
                tracing::warn!(peer = %self.peer_addr, method = other, "unsupported method");
                Some(RtspResponse::new(501, "Not Implemented").add_header("CSeq", &cseq.to_string()))
            }
        }
    }

    fn handle_options(&self, cseq: u64) -> RtspResponse {
        RtspResponse::ok()
            .add_header("CSeq", &cseq.to_string())
            .add_header("Public", "OPTIONS, DESCRIBE, SETUP, TEARDOWN, PLAY")
    }

    fn handle_describe(&mut self, cseq: u64, camera_hash: &str) -> Option<RtspResponse> {
        let description = self
            .registry
            .with_upstream(camera_hash, |upstream| Ok(upstream.description.clone()));

        let description = match description {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(camera_hash, error = %e, "DESCRIBE: upstream negotiation failed");
                return None;
            }
        };

        let sdp_body = sdp::generate(&description, &self.config.local_ip);
        // §4.2 quirk: the camera's own DESCRIBE reply carries a trailing
        // blank line after the SDP and counts it in Content-Length. Emit the
        // same trailing "\r\n\r\n" here so the advertised len(sdp)+4 matches
        // what actually goes out on the wire.
        let content_length = sdp_body.len() + 4;
        let wire_body = format!("{sdp_body}\r\n\r\n");

        Some(
            RtspResponse::ok()
                .add_header("CSeq", &cseq.to_string())
                .add_header("Content-Type", "application/sdp")
                .add_header("Content-Length", &content_length.to_string())
                .with_body(wire_body),
        )
    }

    fn handle_setup(&mut self, request: &RtspRequest, cseq: u64, camera_hash: &str) -> Option<RtspResponse> {
        if let Err(e) = self.registry.with_upstream(camera_hash, |_| Ok(())) {
            tracing::error!(camera_hash, error = %e, "SETUP: upstream negotiation failed");
            return None;
        }

        let requested = match request.transport().and_then(transport_header::parse) {
            Some(mode) => mode,
            None => {
                return Some(
                    RtspResponse::unsupported_transport().add_header("CSeq", &cseq.to_string()),
                );
            }
        };

        if self.session_id.is_none() {
            self.session_id = Some(match request.session_id() {
                Some(existing) => existing.to_string(),
                None => generate_session_id(),
            });
        }

        let track_index = extract_track_index(&request.uri).unwrap_or(self.setup_tracks);

        // Viewer-facing channel assignment always follows the 0-1/2-3
        // convention (§3 invariants), independent of what the upstream
        // negotiated with the camera.
        let reply_mode = match requested {
            TransportMode::Udp { client_port_lo, client_port_hi } => {
                self.udp_client_ports.push(UdpClientPorts {
                    rtp: client_port_lo,
                    rtcp: client_port_hi,
                });
                requested
            }
            TransportMode::TcpInterleaved { .. } => {
                let lo = (track_index * 2) as u8;
                let mode = TransportMode::TcpInterleaved {
                    channel_lo: lo,
                    channel_hi: lo + 1,
                };
                self.tcp_channels.push((lo, lo + 1));
                mode
            }
        };
        self.transport_mode = Some(reply_mode);
        self.setup_tracks += 1;

        let session_id = self.session_id.clone().expect("just assigned above");

        Some(
            RtspResponse::ok()
                .add_header("CSeq", &cseq.to_string())
                .add_header("Transport", &transport_header::server_reply(reply_mode))
                .add_header("Session", &format!("{session_id};timeout=60")),
        )
    }

    fn handle_play(&mut self, cseq: u64, camera_hash: &str) -> Option<RtspResponse> {
        let session_id = self.session_id.clone()?;
        let transport_mode = self.transport_mode?;

        let negotiated = self.registry.with_upstream(camera_hash, |upstream| {
            upstream.play()?;
            let clock_rates = upstream
                .description
                .tracks()
                .iter()
                .map(|t| t.clock_rate)
                .collect::<Vec<_>>();
            Ok((upstream.rtp_info.clone(), upstream.start_wall_time, clock_rates))
        });

        let (rtp_info, start_wall_time, clock_rates) = match negotiated {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(camera_hash, session_id, error = %e, "PLAY: upstream failed to start");
                return None;
            }
        };

        let media = match transport_mode {
            TransportMode::Udp { .. } => SubscriberMedia::Udp {
                client_ports: self.udp_client_ports.clone(),
            },
            TransportMode::TcpInterleaved { .. } => SubscriberMedia::TcpInterleaved {
                channels: self.tcp_channels.clone(),
            },
        };

        let subscriber = Subscriber {
            session_id: session_id.clone(),
            camera_hash: camera_hash.to_string(),
            peer_host: self.peer_addr.ip().to_string(),
            peer_tcp_port: self.peer_addr.port(),
            control_socket: self.control_socket.clone(),
            media,
            user_agent: self.user_agent.clone(),
            last_cseq: cseq,
        };

        if let Err(e) = self.registry.attach(camera_hash, subscriber) {
            tracing::error!(camera_hash, session_id, error = %e, "PLAY: failed to attach subscriber");
            return None;
        }
        self.subscribed = true;

        self.apply_web_limit(camera_hash);
        transport::ensure_fanout_started(camera_hash, &self.config, &self.registry);

        let mut response = RtspResponse::ok()
            .add_header("CSeq", &cseq.to_string())
            .add_header("Session", &session_id);

        if let TransportMode::Udp { .. } = transport_mode
            && let Some(header) = build_rtp_info_header(&rtp_info, &clock_rates, start_wall_time, &self.config)
        {
            response = response.add_header("RTP-Info", &header);
        }

        Some(response)
    }

    fn handle_teardown(&mut self, cseq: u64, camera_hash: &str) -> RtspResponse {
        if let Some(session_id) = &self.session_id
            && self.subscribed
        {
            self.registry.detach(camera_hash, session_id);
            self.subscribed = false;
        }

        let mut response = RtspResponse::ok().add_header("CSeq", &cseq.to_string());
        if let Some(session_id) = &self.session_id {
            response = response.add_header("Session", session_id);
        }
        response
    }

    fn apply_web_limit(&self, camera_hash: &str) {
        if self.config.web_limit == 0 {
            return;
        }

        let web_ids = self
            .registry
            .web_subscriber_session_ids(camera_hash, &self.config.local_ip);
        let limit = self.config.web_limit as usize;
        if web_ids.len() <= limit {
            return;
        }

        let excess = web_ids.len() - limit;
        for session_id in &web_ids[..excess] {
            self.registry.evict(camera_hash, session_id);
            tracing::info!(camera_hash, session_id, "evicted: web_limit exceeded");
        }
    }

    fn cleanup(&mut self) {
        if let (Some(camera_hash), Some(session_id)) = (&self.camera_hash, &self.session_id)
            && self.subscribed
        {
            self.registry.detach(camera_hash, session_id);
        }
    }
}

/// First path segment of a viewer request URI, percent-decoded: the camera
/// hash. `None` if the URI has no path at all.
fn extract_camera_hash(uri: &str) -> Option<String> {
    let after_scheme = uri.split_once("://").map(|(_, rest)| rest).unwrap_or(uri);
    let path_start = after_scheme.find('/')?;
    let path = &after_scheme[path_start + 1..];
    let first_segment = path.split('/').next()?;
    if first_segment.is_empty() {
        return None;
    }
    Some(percent_decode(first_segment))
}

/// Trailing `(track|stream)\d+` segment of a SETUP URI, zero-based.
fn extract_track_index(uri: &str) -> Option<usize> {
    let tail = uri.rsplit('/').next()?;
    for prefix in ["track", "stream"] {
        if let Some(digits) = tail.strip_prefix(prefix)
            && !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
        {
            let n: usize = digits.parse().ok()?;
            return n.checked_sub(1);
        }
    }
    None
}

fn generate_session_id() -> String {
    let mut rng = rand::rng();
    (0..SESSION_ID_LEN)
        .map(|_| SESSION_ID_ALPHABET[rng.random_range(0..SESSION_ID_ALPHABET.len())] as char)
        .collect()
}

/// Build the `RTP-Info` header for a freshly-PLAYing UDP subscriber (§4.5):
/// each track's rtptime is advanced by the wall-clock delta since the
/// upstream's own PLAY, scaled by that track's clock frequency.
fn build_rtp_info_header(
    rtp_info: &[crate::upstream::TrackRtpInfo],
    clock_rates: &[u32],
    start_wall_time: Option<std::time::Instant>,
    config: &Config,
) -> Option<String> {
    let start_wall_time = start_wall_time?;
    let delta_secs = start_wall_time.elapsed().as_secs_f64();

    let entries: Vec<String> = rtp_info
        .iter()
        .enumerate()
        .map(|(i, info)| {
            let track = i + 1;
            let clock_rate = clock_rates.get(i).copied().unwrap_or(0);
            let rtptime_new = info.rtptime.wrapping_add((delta_secs * clock_rate as f64) as u32);
            format!(
                "url=rtsp://{}:{}/track{track};seq={};rtptime={rtptime_new}",
                config.local_ip, config.rtsp_port, info.seq
            )
        })
        .collect();

    if entries.is_empty() {
        None
    } else {
        Some(entries.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_camera_hash_from_plain_path() {
        assert_eq!(
            extract_camera_hash("rtsp://host:554/cam-hash"),
            Some("cam-hash".to_string())
        );
    }

    #[test]
    fn extract_camera_hash_ignores_track_suffix() {
        assert_eq!(
            extract_camera_hash("rtsp://host:554/cam-hash/track1"),
            Some("cam-hash".to_string())
        );
    }

    #[test]
    fn extract_camera_hash_decodes_percent_escapes() {
        assert_eq!(
            extract_camera_hash("rtsp://host/front%20door"),
            Some("front door".to_string())
        );
    }

    #[test]
    fn extract_camera_hash_none_without_path() {
        assert_eq!(extract_camera_hash("rtsp://host:554"), None);
    }

    #[test]
    fn extract_track_index_from_trailing_segment() {
        assert_eq!(extract_track_index("rtsp://h/cam/track1"), Some(0));
        assert_eq!(extract_track_index("rtsp://h/cam/track2"), Some(1));
        assert_eq!(extract_track_index("rtsp://h/cam/stream1"), Some(0));
        assert_eq!(extract_track_index("rtsp://h/cam"), None);
    }

    #[test]
    fn generated_session_id_has_expected_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
