//! The proxy's top-level orchestrator (§4 Component Design overview).
//!
//! Owns the shared [`Config`] and [`Registry`], and runs the viewer accept
//! loop on a background thread. Fan-out threads are started lazily, per
//! camera, by [`transport::ensure_fanout_started`] once the first subscriber
//! reaches PLAY.

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crate::config::Config;
use crate::error::{Result, RtspError};
use crate::registry::Registry;
use crate::transport::tcp;

/// High-level RTSP proxy orchestrator.
pub struct Server {
    config: Arc<Config>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new(config.clone()));
        Self {
            config,
            registry,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Bind the viewer listener and start accepting connections on a
    /// background thread.
    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RtspError::AlreadyRunning);
        }

        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)?;
        listener.set_nonblocking(true)?;

        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let registry = self.registry.clone();
        let running = self.running.clone();

        tracing::info!(addr = %bind_addr, cameras = self.config.cameras.len(), "RTSP proxy listening");

        thread::spawn(move || {
            tcp::accept_loop(listener, config, registry, running);
        });

        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("proxy stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }
}
