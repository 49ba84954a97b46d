//! Transport compression policy.
//!
//! A non-zero level asks for compression of the remote→local direction only;
//! desktop protocol traffic from the server dominates while the client side
//! mostly sends small input events.
//!
//! russh writes one compression list for both directions and has no level
//! setting, so on the wire an enabled policy compresses both directions at
//! zlib's default level. The per-direction policy is still computed and
//! logged.

use russh::{compression, Preferred};
use std::borrow::Cow;

/// Offered when compression is on; zlib variants first so the server picks one
const COMPRESSED: &[compression::Name] = &[compression::ZLIB_LEGACY, compression::ZLIB, compression::NONE];

const UNCOMPRESSED: &[compression::Name] = &[compression::NONE];

/// Per-direction compression; `None` means disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub remote_to_local: Option<u8>,
    pub local_to_remote: Option<u8>,
}

impl CompressionPolicy {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self { remote_to_local: None, local_to_remote: None },
            level => Self {
                remote_to_local: Some(level.min(9)),
                local_to_remote: None,
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.remote_to_local.is_some() || self.local_to_remote.is_some()
    }

    /// Compression list offered to the SSH server
    pub fn offered(&self) -> &'static [compression::Name] {
        if self.is_enabled() {
            COMPRESSED
        } else {
            UNCOMPRESSED
        }
    }

    /// Algorithm preferences for the SSH client config
    pub fn preferred(&self) -> Preferred {
        Preferred {
            compression: Cow::Borrowed(self.offered()),
            ..Preferred::DEFAULT
        }
    }

    pub fn describe(&self) -> String {
        match (self.remote_to_local, self.local_to_remote) {
            (None, None) => "no compression".to_string(),
            (r2l, l2r) => format!(
                "remote->local {}, local->remote {}",
                r2l.map(|l| format!("level {}", l)).unwrap_or_else(|| "off".into()),
                l2r.map(|l| format!("level {}", l)).unwrap_or_else(|| "off".into()),
            ),
        }
    }
}
