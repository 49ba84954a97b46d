//! Deskgate relay
//!
//! A small forwarding service for the connection broker. It validates the
//! caller's origin, probes back-end reachability and relays HTTP requests to
//! upstream endpoints under a bounded timeout.

pub mod config;
pub mod forwarder;
pub mod metrics;
pub mod origin;
pub mod probe;
pub mod server;

pub use config::RelayConfig;
pub use server::{build_router, AppState};
