//! Per-track UDP relay (§4.4 fan-out activation, §4.6 Fan-out).
//!
//! One socket per media track, bound on the port the camera was told to
//! send RTP to (`client_port=` in the upstream SETUP). Each socket gets its
//! own relay thread that copies every datagram it receives out to the
//! matching `client_port` of every subscriber currently attached.

use std::net::UdpSocket;
use std::sync::Arc;
use std::thread;

use crate::registry::Registry;
use crate::subscriber::FanoutTarget;

/// Largest RTP/RTCP datagram we expect from a camera. Generous relative to
/// typical MTU-bounded RTP packets.
const RECV_BUF_SIZE: usize = 2048;

/// Spawn one relay thread per track once the upstream has negotiated its
/// tracks. No-op (but logs and clears fan-out state) if the upstream isn't
/// reachable.
pub fn spawn_fanout(camera_hash: String, registry: Arc<Registry>) {
    let ports = registry.with_upstream(&camera_hash, |upstream| {
        Ok(upstream.udp_ports)
    });
    let track_count = registry.with_upstream(&camera_hash, |upstream| Ok(upstream.channels.len()));

    let (ports, track_count) = match (ports, track_count) {
        (Ok(ports), Ok(count)) => (ports, count),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(camera_hash, error = %e, "can't start UDP fan-out: upstream unavailable");
            registry.force_close(&camera_hash);
            return;
        }
    };

    for track_index in 0..track_count {
        let rtp_port = ports[track_index * 2];
        let camera_hash = camera_hash.clone();
        let registry = registry.clone();
        thread::spawn(move || run_fanout(track_index, rtp_port, camera_hash, registry));
    }
}

fn run_fanout(track_index: usize, rtp_port: u16, camera_hash: String, registry: Arc<Registry>) {
    let socket = match UdpSocket::bind(("0.0.0.0", rtp_port)) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(camera_hash, track_index, rtp_port, error = %e, "can't bind UDP relay socket");
            registry.force_close(&camera_hash);
            return;
        }
    };
    tracing::info!(camera_hash, track_index, rtp_port, "UDP relay started");

    let mut buf = [0u8; RECV_BUF_SIZE];
    loop {
        if registry.subscriber_count(&camera_hash) == 0 {
            break;
        }

        let n = match socket.recv(&mut buf) {
            Ok(n) => n,
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                tracing::warn!(camera_hash, track_index, error = %e, "UDP relay read failed");
                break;
            }
        };

        for target in registry.fanout_targets(&camera_hash) {
            let FanoutTarget::Udp {
                peer_host,
                client_ports,
                ..
            } = target
            else {
                continue;
            };
            let Some(ports) = client_ports.get(track_index) else {
                continue;
            };
            let _ = socket.send_to(&buf[..n], (peer_host.as_str(), ports.rtp));
        }
    }

    registry.force_close(&camera_hash);
    tracing::info!(camera_hash, track_index, "UDP relay stopped");
}
