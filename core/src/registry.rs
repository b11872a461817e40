//! Process-wide camera registry (§3 Camera Registry Entry, §4.6).
//!
//! One entry per configured camera, each guarded by its own
//! [`parking_lot::Mutex`] so that unrelated cameras never contend. The
//! upstream connects lazily — on the first subscriber — and is torn down
//! when the last subscriber leaves.

use std::collections::HashMap;
use std::net::Shutdown;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{ClientClass, Config, classify_client};
use crate::error::{RtspError, Result};
use crate::subscriber::{FanoutTarget, Subscriber};
use crate::upstream::Upstream;

struct CameraEntry {
    index: usize,
    upstream: Option<Upstream>,
    subscribers: Vec<Subscriber>,
    fanout_started: bool,
}

/// Shared, thread-safe map from camera hash to {upstream, subscribers}.
pub struct Registry {
    config: Arc<Config>,
    entries: HashMap<String, Mutex<CameraEntry>>,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Self {
        let entries = config
            .cameras
            .iter()
            .enumerate()
            .map(|(index, camera)| {
                (
                    camera.hash.clone(),
                    Mutex::new(CameraEntry {
                        index,
                        upstream: None,
                        subscribers: Vec::new(),
                        fanout_started: false,
                    }),
                )
            })
            .collect();

        Registry { config, entries }
    }

    pub fn contains(&self, camera_hash: &str) -> bool {
        self.entries.contains_key(camera_hash)
    }

    /// Run `f` with the negotiated upstream for `camera_hash`, connecting it
    /// first if this is the first reference. The camera lock is held across
    /// the connect itself (not just the map mutation) so concurrent
    /// first-subscribers share the single resulting connection (§4.6, §8
    /// property: exactly one connect per camera).
    pub fn with_upstream<T>(&self, camera_hash: &str, f: impl FnOnce(&mut Upstream) -> Result<T>) -> Result<T> {
        let entry_lock = self
            .entries
            .get(camera_hash)
            .ok_or_else(|| RtspError::UnknownCamera(camera_hash.to_string()))?;
        let mut entry = entry_lock.lock();

        if entry.upstream.is_none() {
            let upstream = Upstream::open(camera_hash, &self.config, entry.index)?;
            entry.upstream = Some(upstream);
        }

        f(entry.upstream.as_mut().expect("just ensured Some"))
    }

    /// Register a subscriber that has completed SETUP.
    pub fn attach(&self, camera_hash: &str, subscriber: Subscriber) -> Result<()> {
        let entry_lock = self
            .entries
            .get(camera_hash)
            .ok_or_else(|| RtspError::UnknownCamera(camera_hash.to_string()))?;
        entry_lock.lock().subscribers.push(subscriber);
        Ok(())
    }

    /// Remove a subscriber by session id. If this empties the subscriber
    /// set, the upstream is dropped (closing its control connection) and
    /// `true` is returned so the caller can stop any fan-out threads.
    pub fn detach(&self, camera_hash: &str, session_id: &str) -> bool {
        let Some(entry_lock) = self.entries.get(camera_hash) else {
            return false;
        };
        let mut entry = entry_lock.lock();
        entry.subscribers.retain(|s| s.session_id != session_id);

        if entry.subscribers.is_empty() {
            entry.upstream = None;
            entry.fanout_started = false;
            true
        } else {
            false
        }
    }

    /// Force-close a subscriber from outside its own connection thread:
    /// used by web-limit eviction (§4.5). Shuts down its control socket so
    /// its owning connection thread observes the close and exits normally.
    pub fn evict(&self, camera_hash: &str, session_id: &str) -> bool {
        let Some(entry_lock) = self.entries.get(camera_hash) else {
            return false;
        };
        let mut entry = entry_lock.lock();
        let Some(pos) = entry.subscribers.iter().position(|s| s.session_id == session_id) else {
            return false;
        };
        let removed = entry.subscribers.remove(pos);
        let _ = removed.control_socket.lock().shutdown(Shutdown::Both);

        if entry.subscribers.is_empty() {
            entry.upstream = None;
            entry.fanout_started = false;
        }
        true
    }

    /// Unconditionally drop a camera's upstream and fan-out state, used when
    /// a fan-out loop observes the upstream connection itself has died.
    /// Idempotent.
    pub fn force_close(&self, camera_hash: &str) {
        if let Some(entry_lock) = self.entries.get(camera_hash) {
            let mut entry = entry_lock.lock();
            entry.upstream = None;
            entry.fanout_started = false;
        }
    }

    /// Mark fan-out as started for a camera. Returns `true` only the first
    /// time this is called since the upstream was (re-)opened, so the
    /// caller can spawn fan-out threads exactly once per upstream lifetime.
    pub fn mark_fanout_started(&self, camera_hash: &str) -> bool {
        let Some(entry_lock) = self.entries.get(camera_hash) else {
            return false;
        };
        let mut entry = entry_lock.lock();
        if entry.fanout_started {
            false
        } else {
            entry.fanout_started = true;
            true
        }
    }

    /// Session ids of subscribers classified `web` under `local_ip`, in
    /// insertion order (§4.5 web-limit eviction order).
    pub fn web_subscriber_session_ids(&self, camera_hash: &str, local_ip: &str) -> Vec<String> {
        let Some(entry_lock) = self.entries.get(camera_hash) else {
            return Vec::new();
        };
        entry_lock
            .lock()
            .subscribers
            .iter()
            .filter(|s| classify_client(&s.peer_host, local_ip) == ClientClass::Web)
            .map(|s| s.session_id.clone())
            .collect()
    }

    /// Number of subscribers currently attached to a camera.
    pub fn subscriber_count(&self, camera_hash: &str) -> usize {
        self.entries
            .get(camera_hash)
            .map(|e| e.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Snapshot cloneable delivery handles for every current subscriber of a
    /// camera. The registry lock is held only long enough to clone the
    /// handles out — released before the caller does any fan-out I/O
    /// (§4.6, §5).
    pub fn fanout_targets(&self, camera_hash: &str) -> Vec<FanoutTarget> {
        let Some(entry_lock) = self.entries.get(camera_hash) else {
            return Vec::new();
        };
        entry_lock
            .lock()
            .subscribers
            .iter()
            .map(Subscriber::fanout_target)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::Duration;

    use super::*;
    use crate::config::CameraConfig;
    use crate::subscriber::SubscriberMedia;

    /// A throwaway `Arc<Mutex<TcpStream>>` backed by a real loopback socket,
    /// standing in for a subscriber's RTSP control connection. Good enough
    /// to observe a `shutdown()` from the other end.
    fn fake_control_socket() -> (Arc<Mutex<TcpStream>>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server_side = TcpStream::connect(addr).unwrap();
        let (client_side, _) = listener.accept().unwrap();
        (Arc::new(Mutex::new(server_side)), client_side)
    }

    fn fake_subscriber(session_id: &str, peer_host: &str, camera_hash: &str) -> (Subscriber, TcpStream) {
        let (control_socket, client_side) = fake_control_socket();
        let subscriber = Subscriber {
            session_id: session_id.to_string(),
            camera_hash: camera_hash.to_string(),
            peer_host: peer_host.to_string(),
            peer_tcp_port: 0,
            control_socket,
            media: SubscriberMedia::Udp { client_ports: Vec::new() },
            user_agent: "test".to_string(),
            last_cseq: 0,
        };
        (subscriber, client_side)
    }

    fn test_registry() -> Registry {
        let config = Arc::new(Config::new(vec![CameraConfig::new("cam1", "rtsp://unused")]));
        Registry::new(config)
    }

    #[test]
    fn web_limit_evicts_oldest_web_subscriber_and_closes_its_socket() {
        let registry = test_registry();
        // Neither loopback (§6 quirk): web_subscriber_session_ids filters on
        // classify_client against a local_ip far from either peer.
        let (sub_a, mut client_a) = fake_subscriber("sessA", "8.8.8.8", "cam1");
        let (sub_b, _client_b) = fake_subscriber("sessB", "9.9.9.9", "cam1");
        registry.attach("cam1", sub_a).unwrap();
        registry.attach("cam1", sub_b).unwrap();

        let web_ids = registry.web_subscriber_session_ids("cam1", "127.0.0.1");
        assert_eq!(web_ids, vec!["sessA".to_string(), "sessB".to_string()]);

        // Evict the oldest (sessA), simulating web_limit = 1.
        assert!(registry.evict("cam1", "sessA"));
        assert_eq!(registry.subscriber_count("cam1"), 1);

        client_a.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut buf = [0u8; 8];
        let n = client_a.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "evicted subscriber's control socket should observe EOF");
    }

    #[test]
    fn evicting_the_last_subscriber_clears_the_upstream_slot() {
        let registry = test_registry();
        let (sub, _client) = fake_subscriber("sess1", "8.8.8.8", "cam1");
        registry.attach("cam1", sub).unwrap();
        assert!(registry.mark_fanout_started("cam1"));

        assert!(registry.evict("cam1", "sess1"));
        assert_eq!(registry.subscriber_count("cam1"), 0);
        // fanout_started was reset, so a fresh subscriber can start it again.
        assert!(registry.mark_fanout_started("cam1"));
    }

    #[test]
    fn evict_unknown_session_is_a_no_op() {
        let registry = test_registry();
        assert!(!registry.evict("cam1", "nonexistent"));
        assert!(!registry.evict("no-such-camera", "nonexistent"));
    }
}
