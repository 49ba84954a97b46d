//! Deskgate tunnel launcher
//!
//! Opens an SSH session to the desktop gateway, forwards one loopback port
//! to the desktop host and launches the desktop client against it.

pub mod child;
pub mod compression;
pub mod params;
pub mod port;
pub mod session;
pub mod state;
pub mod transport;

pub use params::TunnelParams;
pub use session::{SessionReport, TunnelSession};
