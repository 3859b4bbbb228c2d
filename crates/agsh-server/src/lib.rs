//! agsh-server: Agent Shell session worker.
//!
//! Spawns PTY-backed agent CLI sessions, fans their output out to attached
//! viewers over WebSocket with ring-buffer replay on reconnect, reaps
//! abandoned sessions, and serves the control-plane REST API.

pub mod auth;
pub mod config;
pub mod http;
pub mod session;
pub mod workspace;
