//! Viewer accept loop and the TCP-interleaved fan-out loop (§4.4, §4.6).

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::downstream;
use crate::registry::Registry;
use crate::subscriber::FanoutTarget;

/// How many bytes to read per pass through the interleaved relay loop
/// (§4.4: "up to 2048 bytes per read").
const FANOUT_READ_SIZE: usize = 2048;

/// Non-blocking accept loop for viewer connections. Checks `running` between
/// accepts with a 50ms poll interval so [`crate::server::Server::stop`] can
/// terminate it promptly.
pub fn accept_loop(listener: TcpListener, config: Arc<Config>, registry: Arc<Registry>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if stream.set_nonblocking(false).is_err() {
                    continue;
                }
                let config = config.clone();
                let registry = registry.clone();
                thread::spawn(move || {
                    downstream::handle(stream, peer_addr, config, registry);
                });
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "viewer accept error");
                }
            }
        }
    }
    tracing::debug!("viewer accept loop exited");
}

/// Spawn the TCP-interleaved fan-out thread for a camera, once its upstream
/// has negotiated a session. No-op (but logs) if the upstream can't hand
/// back its media socket.
pub fn spawn_fanout(camera_hash: String, registry: Arc<Registry>) {
    let stream = registry.with_upstream(&camera_hash, |upstream| upstream.media_stream());
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(camera_hash, error = %e, "can't start TCP fan-out: upstream unavailable");
            registry.force_close(&camera_hash);
            return;
        }
    };

    thread::spawn(move || run_fanout(stream, camera_hash, registry));
}

fn run_fanout(mut stream: TcpStream, camera_hash: String, registry: Arc<Registry>) {
    tracing::info!(camera_hash, "TCP interleaved fan-out started");
    let mut buf = [0u8; FANOUT_READ_SIZE];

    loop {
        if registry.subscriber_count(&camera_hash) == 0 {
            break;
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                tracing::warn!(camera_hash, error = %e, "upstream media read failed");
                break;
            }
        };

        let targets = registry.fanout_targets(&camera_hash);
        if targets.is_empty() {
            break;
        }

        for target in targets {
            let FanoutTarget::Tcp { session_id, socket } = target else {
                continue;
            };
            let write_result = socket.lock().write_all(&buf[..n]);
            if write_result.is_err() {
                registry.detach(&camera_hash, &session_id);
            }
        }
    }

    registry.force_close(&camera_hash);
    tracing::info!(camera_hash, "TCP interleaved fan-out stopped");
}
