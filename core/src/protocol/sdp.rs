//! SDP (Session Description Protocol) parsing and generation (RFC 4566).
//!
//! Two directions:
//!
//! - [`Description::parse`] reads the SDP body out of a camera's DESCRIBE
//!   reply, extracting just enough per media line to drive the proxy: the
//!   `m=` line, `b=` bandwidth, `a=rtpmap`/`a=fmtp`, and clock frequency.
//! - [`generate`] re-emits a brand new SDP for the downstream viewer. The
//!   proxy never forwards the camera's SDP verbatim — origin, session name
//!   and track control names are always proxy-local (§4.2).
//!
//! Track control identifiers (`a=control:trackN` / `a=control:streamN`) are
//! collected separately by [`extract_track_control_ids`] since they live at
//! the reply level, not the parsed [`Description`].

use rand::Rng;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Per-track media description extracted from a camera's SDP.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaTrack {
    /// The part of `m=video <media>` / `m=audio <media>` after the keyword
    /// (e.g. `"0 RTP/AVP 96"`).
    pub media: String,
    /// Raw `b=` line value, if present (video only in practice).
    pub bandwidth: String,
    /// `<encoding>/<clock>` from `a=rtpmap:<pt>/<encoding>/<clock>` sans the
    /// leading payload type, e.g. `"H264/90000"`.
    pub rtpmap: String,
    /// Integer clock rate parsed out of `rtpmap`, e.g. `90000`.
    pub clock_rate: u32,
    /// Raw `a=fmtp:` value, if present.
    pub fmtp: String,
}

/// Parsed camera SDP: optional video and audio tracks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub video: Option<MediaTrack>,
    pub audio: Option<MediaTrack>,
}

impl Description {
    /// Ordered list of tracks present (video first, then audio) — matches
    /// the order `a=control:` lines appear in a conventional SDP.
    pub fn tracks(&self) -> Vec<&MediaTrack> {
        let mut out = Vec::with_capacity(2);
        if let Some(v) = &self.video {
            out.push(v);
        }
        if let Some(a) = &self.audio {
            out.push(a);
        }
        out
    }
}

/// Locate the SDP segment in a full RTSP DESCRIBE reply: the region after
/// the first blank line.
pub fn body_from_reply(reply: &str) -> Result<&str> {
    let idx = reply.find("\r\n\r\n").or_else(|| reply.find("\n\n"));
    match idx {
        Some(pos) => {
            let sep_len = if reply[pos..].starts_with("\r\n\r\n") {
                4
            } else {
                2
            };
            Ok(reply[pos + sep_len..].trim())
        }
        None => Err(RtspError::Parse {
            kind: ParseErrorKind::InvalidSdp("no blank line separating headers from body"),
        }),
    }
}

/// Parse an SDP body into video/audio [`MediaTrack`]s. At least one of
/// video/audio must be present (some cameras are audio-only).
pub fn parse(sdp: &str) -> Result<Description> {
    let video = parse_media_block(sdp, "m=video");
    let audio = parse_media_block(sdp, "m=audio");

    if video.is_none() && audio.is_none() {
        return Err(RtspError::Parse {
            kind: ParseErrorKind::InvalidSdp("no m=video or m=audio line"),
        });
    }

    Ok(Description { video, audio })
}

fn parse_media_block(sdp: &str, keyword: &str) -> Option<MediaTrack> {
    let lines: Vec<&str> = sdp.lines().collect();
    let start = lines.iter().position(|l| l.starts_with(keyword))?;
    let media = lines[start][keyword.len()..].trim().to_string();

    // The block runs until the next m= line (or end of SDP).
    let end = lines[start + 1..]
        .iter()
        .position(|l| l.starts_with("m="))
        .map(|rel| start + 1 + rel)
        .unwrap_or(lines.len());
    let block = &lines[start..end];

    let mut track = MediaTrack {
        media,
        ..Default::default()
    };

    for line in block {
        if let Some(v) = line.strip_prefix("b=") {
            track.bandwidth = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("a=rtpmap:") {
            // "<pt> <encoding>/<clock>[/<params>]"
            if let Some((_, enc_clock)) = v.split_once(' ') {
                track.rtpmap = enc_clock.trim().to_string();
                if let Some((_, clock)) = enc_clock.split_once('/') {
                    let clock = clock.split('/').next().unwrap_or(clock);
                    track.clock_rate = clock.trim().parse().unwrap_or(0);
                }
            }
        } else if let Some(v) = line.strip_prefix("a=fmtp:") {
            track.fmtp = v.trim().to_string();
        }
    }

    Some(track)
}

/// Collect `a=control:` track identifiers matching `(track|stream)\d+`, in
/// the order they appear in the reply. Requires at least one match.
pub fn extract_track_control_ids(reply: &str) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    for line in reply.lines() {
        let Some(value) = line.trim().strip_prefix("a=control:") else {
            continue;
        };
        if let Some(id) = trailing_track_or_stream_token(value.trim()) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Err(RtspError::Parse {
            kind: ParseErrorKind::InvalidSdp("no a=control: track identifier"),
        });
    }
    Ok(ids)
}

/// `value` is typically a bare `trackN`/`streamN`, or a URL ending in one
/// (`rtsp://host/path/track1`). Extract the trailing `(track|stream)\d+` token.
fn trailing_track_or_stream_token(value: &str) -> Option<String> {
    let tail = value.rsplit('/').next().unwrap_or(value);
    for prefix in ["track", "stream"] {
        if let Some(digits) = tail.strip_prefix(prefix)
            && !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
        {
            return Some(tail.to_string());
        }
    }
    None
}

/// Generate the proxy-local SDP returned to viewers (§4.2). Track control
/// identifiers are always renamed to `track1`/`track2`, regardless of what
/// the upstream camera called them.
pub fn generate(description: &Description, local_ip: &str) -> String {
    let mut rng = rand::rng();
    let session_id: u32 = rng.random_range(100_000..1_000_000);
    let session_version: u32 = rng.random_range(1..10);

    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- {session_id} {session_version} IN IP4 {local_ip}"),
        "s=python-rtsp-server".to_string(),
        "t=0 0".to_string(),
    ];

    if let Some(video) = &description.video {
        lines.push(format!("m=video {}", video.media));
        lines.push("c=IN IP4 0.0.0.0".to_string());
        lines.push(format!("b={}", video.bandwidth));
        lines.push(format!("a=rtpmap:{}", video.rtpmap));
        lines.push(format!("a=fmtp:{}", video.fmtp));
        lines.push("a=control:track1".to_string());
    }

    if let Some(audio) = &description.audio {
        lines.push(format!("m=audio {}", audio.media));
        lines.push(format!("a=rtpmap:{}", audio.rtpmap));
        lines.push("a=control:track2".to_string());
    }

    lines.join("\r\n")
}
