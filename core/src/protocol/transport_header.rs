//! `Transport` header parsing and emission (RFC 2326 §12.39).
//!
//! Two shapes matter to this proxy:
//!
//! - UDP unicast: `RTP/AVP;unicast;client_port=8000-8001`, with the server
//!   echoing back `;server_port=9000-9001`.
//! - TCP interleaved: `RTP/AVP/TCP;unicast;interleaved=0-1`, where the RTP
//!   and RTCP channels are framed `$`-prefixed binary blocks on the same
//!   TCP connection instead of separate UDP sockets (§4.5).

/// The delivery mode a viewer (or the upstream camera) asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp { client_port_lo: u16, client_port_hi: u16 },
    TcpInterleaved { channel_lo: u8, channel_hi: u8 },
}

/// Parse a `Transport` header value, picking out whichever of
/// `client_port=` / `interleaved=` is present. `RTP/AVP/TCP` with no
/// `interleaved=` range is treated as channels 0-1 (the common default).
pub fn parse(value: &str) -> Option<TransportMode> {
    if let Some(range) = find_param(value, "interleaved=") {
        let (lo, hi) = split_range(range)?;
        return Some(TransportMode::TcpInterleaved {
            channel_lo: lo as u8,
            channel_hi: hi as u8,
        });
    }

    if let Some(range) = find_param(value, "client_port=") {
        let (lo, hi) = split_range(range)?;
        return Some(TransportMode::Udp {
            client_port_lo: lo,
            client_port_hi: hi,
        });
    }

    if value.contains("RTP/AVP/TCP") {
        return Some(TransportMode::TcpInterleaved {
            channel_lo: 0,
            channel_hi: 1,
        });
    }

    None
}

fn find_param<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    let pos = value.find(key)? + key.len();
    let rest = &value[pos..];
    let end = rest.find(';').unwrap_or(rest.len());
    Some(&rest[..end])
}

fn split_range(range: &str) -> Option<(u16, u16)> {
    match range.split_once('-') {
        Some((lo, hi)) => Some((lo.trim().parse().ok()?, hi.trim().parse().ok()?)),
        None => {
            let only: u16 = range.trim().parse().ok()?;
            Some((only, only))
        }
    }
}

/// Build the server-side `Transport` header echoed back on a SETUP 200.
pub fn server_reply(mode: TransportMode) -> String {
    match mode {
        TransportMode::Udp {
            client_port_lo,
            client_port_hi,
        } => format!(
            "RTP/AVP;unicast;client_port={client_port_lo}-{client_port_hi};server_port=0-0"
        ),
        TransportMode::TcpInterleaved { channel_lo, channel_hi } => {
            format!("RTP/AVP/TCP;unicast;interleaved={channel_lo}-{channel_hi}")
        }
    }
}

/// Build the `Transport` header this proxy sends upstream for a UDP-mode
/// camera session.
pub fn client_request(port_lo: u16, port_hi: u16) -> String {
    format!("RTP/AVP;unicast;client_port={port_lo}-{port_hi}")
}

/// Build the `Transport` header this proxy sends upstream for a
/// TCP-interleaved-mode camera session (§4.4: `0-1` for video, `2-3` for
/// audio).
pub fn client_request_interleaved(channel_lo: u8, channel_hi: u8) -> String {
    format!("RTP/AVP/TCP;unicast;interleaved={channel_lo}-{channel_hi}")
}
