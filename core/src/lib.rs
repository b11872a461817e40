//! # rtsp-relay — multi-client RTSP proxy
//!
//! A Rust library that sits in front of RTSP cameras and lets any number of
//! viewers watch the same camera without opening a second connection to it.
//! The proxy maintains exactly one upstream connection per camera, no matter
//! how many viewers are attached, and regenerates SDP/session state for each
//! viewer independently.
//!
//! ## Protocol references
//!
//! | RFC | Topic | How this crate uses it |
//! |-----|-------|----------------------|
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, session lifecycle, transport negotiation |
//! | [RFC 2069](https://tools.ietf.org/html/rfc2069) | HTTP Digest (pre-qop) | Upstream camera authentication |
//! | [RFC 4566](https://tools.ietf.org/html/rfc4566) | SDP | Session description regeneration for DESCRIBE replies |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  cli                                      │
//! ├──────────────────────────────────────────┤
//! │  Server      — orchestrator, accept loop │
//! │  Registry    — per-camera upstream/subs  │
//! ├──────────────────────────────────────────┤
//! │  Downstream  — per-viewer RTSP connection│
//! │  Upstream    — per-camera RTSP connection│
//! │  Protocol    — RTSP parsing, SDP         │
//! ├──────────────────────────────────────────┤
//! │  Transport   — viewer accept loop, fan-out│
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Crate layout
//!
//! - [`server`] — High-level [`Server`] orchestrator.
//! - [`config`] — [`Config`], camera table, and client classification.
//! - [`registry`] — [`Registry`]: per-camera upstream + subscriber bookkeeping.
//! - [`upstream`] — The camera-facing RTSP session.
//! - [`downstream`] — The viewer-facing RTSP session.
//! - [`subscriber`] — Per-viewer session state and fan-out handles.
//! - [`protocol`] — RTSP request/response/reply parsing, SDP generation.
//! - [`transport`] — Viewer accept loop and TCP/UDP media fan-out.
//! - [`digest`] — RTSP Digest authentication (RFC 2069 style, no qop).
//! - [`url`] — Camera URL parsing.
//! - [`error`] — [`RtspError`] enum and [`Result`] alias.

pub mod config;
pub mod digest;
pub mod downstream;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod subscriber;
pub mod transport;
pub mod upstream;
pub mod url;

pub use config::{CameraConfig, Config};
pub use error::{Result, RtspError};
pub use registry::Registry;
pub use server::Server;
