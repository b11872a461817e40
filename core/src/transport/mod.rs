//! Media fan-out and the viewer accept loop (§4.4 fan-out activation,
//! §4.6 Fan-out).
//!
//! - [`tcp`]: the viewer-facing accept loop, and the TCP-interleaved
//!   fan-out loop that mirrors bytes read off the upstream camera socket to
//!   every subscriber's RTSP connection.
//! - [`udp`]: one relay thread per media track, copying camera datagrams to
//!   every subscriber's negotiated `client_port`.

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use crate::config::Config;
use crate::registry::Registry;

/// Start this camera's fan-out threads if they haven't already been started
/// for the current upstream. Safe to call from every subscriber that
/// reaches PLAY — only the first call for a given upstream actually spawns
/// anything (§4.4: fan-out starts when the first subscriber reaches PLAY).
pub fn ensure_fanout_started(camera_hash: &str, config: &Arc<Config>, registry: &Arc<Registry>) {
    if !registry.mark_fanout_started(camera_hash) {
        return;
    }

    if config.tcp_mode {
        tcp::spawn_fanout(camera_hash.to_string(), registry.clone());
    } else {
        udp::spawn_fanout(camera_hash.to_string(), registry.clone());
    }
}
