//! The desktop client launched alongside the tunnel.
//!
//! The child gets the bound port in `TLISTEN` and never sees `TPARAMS`. Its
//! stdio is relayed through the launcher with one pump per stream.

use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use deskgate_shared::pump::{pump, PumpReport};
use deskgate_shared::{Error, Result};

use crate::params::{ENV_LISTEN, ENV_PARAMS};

/// Program and arguments of the client to launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ChildCommand {
    /// Split `argv` into program and arguments; `None` when empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

/// Build the child process for `command` listening on `port`
pub fn build_command(command: &ChildCommand, port: u16) -> Command {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .env_remove(ENV_PARAMS)
        .env(ENV_LISTEN, port.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

/// A running child plus the pumps relaying its stdio
pub struct ChildRelay {
    child: Child,
    pumps: Vec<JoinHandle<PumpReport>>,
}

impl ChildRelay {
    /// Launch `command` and relay its stdio to the launcher's own
    pub fn launch(command: &ChildCommand, port: u16) -> Result<Self> {
        Self::launch_with(command, port, tokio::io::stdin(), tokio::io::stdout(), tokio::io::stderr())
    }

    /// Launch `command` relaying its stdio to the given streams
    pub fn launch_with<I, O, E>(command: &ChildCommand, port: u16, stdin: I, stdout: O, stderr: E) -> Result<Self>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        let mut child = build_command(command, port)
            .spawn()
            .map_err(|e| Error::Config(format!("cannot launch '{}': {}", command.program, e)))?;
        info!("Launched '{}' (pid {:?}) on port {}", command.program, child.id(), port);

        let mut pumps = Vec::with_capacity(3);
        if let Some(child_stdin) = child.stdin.take() {
            pumps.push(tokio::spawn(async move { pump("child stdin", stdin, child_stdin).await }));
        }
        if let Some(child_stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(async move { pump("child stdout", child_stdout, stdout).await }));
        }
        if let Some(child_stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(async move { pump("child stderr", child_stderr, stderr).await }));
        }

        Ok(Self { child, pumps })
    }

    /// Wait for the child to exit and its output to drain
    pub async fn wait(mut self) -> Result<std::process::ExitStatus> {
        let status = self.child.wait().await?;
        // stdin pump would wait on the launcher's stdin forever
        if let Some(stdin_pump) = self.pumps.first() {
            stdin_pump.abort();
        }
        for handle in self.pumps {
            let _ = handle.await;
        }
        Ok(status)
    }

    /// Stop relaying. The child keeps running on its own.
    pub fn detach(mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!("Child already exited with {}", status),
            Ok(None) => debug!("Child still running at session close"),
            Err(e) => warn!("Cannot query child status: {}", e),
        }
        for handle in self.pumps {
            handle.abort();
        }
    }
}
