//! tracing bootstrap shared by the relay and the tunnel launcher.

use tracing_subscriber::EnvFilter;

/// Where formatted log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// Keeps stdout free for whatever a child process prints there
    Stderr,
}

/// Build the filter: `RUST_LOG` wins, otherwise `<crate_name>=info`
/// (or `debug` when `verbose`).
pub fn filter(crate_name: &str, verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{}={},deskgate_shared={}", crate_name, level, level)))
}

/// Install the global fmt subscriber. Safe to call once per process.
pub fn init(crate_name: &str, verbose: bool, target: LogTarget) {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(crate_name, verbose));
    let res = match target {
        LogTarget::Stdout => builder.try_init(),
        LogTarget::Stderr => builder.with_writer(std::io::stderr).try_init(),
    };
    if let Err(e) = res {
        eprintln!("logging already initialised: {}", e);
    }
}
