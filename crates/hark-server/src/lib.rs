//! Voice-to-agent relay server.
//!
//! Accepts voice and text requests from watch/phone/dashboard clients,
//! transcribes audio, drives a persistent coding-agent subprocess over an
//! NDJSON stream, brokers out-of-band tool-permission decisions, and fans
//! live state out to every subscribed WebSocket client.

pub mod audio_store;
pub mod broker;
pub mod bus;
pub mod config_store;
pub mod gateway;
pub mod guard;
pub mod peer_auth;
pub mod service;
pub mod state;
pub mod turns;

pub use gateway::{serve_http, serve_ws, SharedRelay};
pub use service::{Relay, RelayDeps};
