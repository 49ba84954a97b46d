use clap::Parser;
use std::time::Duration;
use tracing::{error, info};

use deskgate_shared::error::EXIT_USAGE;
use deskgate_shared::logging::{self, LogTarget};
use deskgate_shared::signal;
use deskgate_tunnel::child::ChildCommand;
use deskgate_tunnel::transport::SshConnector;
use deskgate_tunnel::{TunnelParams, TunnelSession};

#[derive(Parser)]
#[command(name = "deskgate-tunnel")]
#[command(author = "Deskgate Team")]
#[command(version)]
#[command(about = "Single-use SSH tunnel for a desktop client", long_about = None)]
#[command(after_help = "Tunnel parameters are read from the TPARAMS environment variable:\n  <user> <password> <sshHost> <sshPort> <targetHost> <targetPort> <compression> [<extraWindowSecs>]")]
struct LaunchArgs {
    /// Local port to forward (0 picks a random free port)
    local_port: u16,

    /// Desktop client command; gets the port in TLISTEN
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// Seconds to wait for the client to connect
    #[arg(long, value_name = "SECS")]
    accept_grace: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let args = LaunchArgs::parse();
    logging::init("deskgate_tunnel", args.verbose, LogTarget::Stderr);

    let mut params = match TunnelParams::from_env() {
        Ok(params) => params,
        Err(e) => {
            eprintln!("deskgate-tunnel: {}", e);
            std::process::exit(EXIT_USAGE);
        }
    };
    if let Some(secs) = args.accept_grace {
        params = params.with_accept_grace(Duration::from_secs(secs));
    }
    let Some(command) = ChildCommand::from_argv(&args.command) else {
        eprintln!("deskgate-tunnel: no client command given");
        std::process::exit(EXIT_USAGE);
    };
    info!("Tunnel parameters: {:?}", params);

    let session = TunnelSession::new(SshConnector::default(), params, args.local_port);
    let code = match session.run(Some(command), signal::shutdown_signal()).await {
        Ok(report) => {
            info!("Tunnel on port {} finished ({:?})", report.local_port, report.reason);
            0
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("deskgate-tunnel: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}
