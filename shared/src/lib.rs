//! Deskgate Shared Library
//!
//! Error taxonomy, broker wire types, byte pumps, logging and signal handling used by
//! both the relay daemon and the tunnel launcher.

pub mod protocol;
pub mod pump;
pub mod logging;
pub mod error;
pub mod signal;

pub use error::{Error, Result};
