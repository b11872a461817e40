//! A single downstream viewer's session state (§3 Subscriber).

use std::net::TcpStream;
use std::sync::Arc;

use parking_lot::Mutex;

/// Per-track UDP destination a subscriber asked for via `client_port=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpClientPorts {
    pub rtp: u16,
    pub rtcp: u16,
}

/// How a subscriber receives media, mirroring the mode it negotiated in
/// SETUP (§4.5).
pub enum SubscriberMedia {
    /// Per-track destination ports, in SETUP order (video first).
    Udp { client_ports: Vec<UdpClientPorts> },
    /// Interleaved channel pairs, in SETUP order. Media for this subscriber
    /// travels over the same socket as `control_socket`.
    TcpInterleaved { channels: Vec<(u8, u8)> },
}

/// One downstream viewer, from its first SETUP through TEARDOWN/disconnect.
pub struct Subscriber {
    pub session_id: String,
    pub camera_hash: String,
    pub peer_host: String,
    pub peer_tcp_port: u16,
    /// The viewer's RTSP TCP connection. Kept so admission control (§4.5
    /// web limit) and last-resort cleanup can force-close a subscriber from
    /// outside its own connection thread.
    pub control_socket: Arc<Mutex<TcpStream>>,
    pub media: SubscriberMedia,
    pub user_agent: String,
    pub last_cseq: u64,
}

/// A cheaply-cloned handle to one subscriber's delivery endpoint, taken as a
/// snapshot so fan-out never holds the registry lock across socket I/O
/// (§4.6, §5).
#[derive(Clone)]
pub enum FanoutTarget {
    Tcp {
        session_id: String,
        socket: Arc<Mutex<TcpStream>>,
    },
    Udp {
        session_id: String,
        peer_host: String,
        client_ports: Vec<UdpClientPorts>,
    },
}

impl Subscriber {
    pub fn fanout_target(&self) -> FanoutTarget {
        match &self.media {
            SubscriberMedia::TcpInterleaved { .. } => FanoutTarget::Tcp {
                session_id: self.session_id.clone(),
                socket: self.control_socket.clone(),
            },
            SubscriberMedia::Udp { client_ports } => FanoutTarget::Udp {
                session_id: self.session_id.clone(),
                peer_host: self.peer_host.clone(),
                client_ports: client_ports.clone(),
            },
        }
    }
}
