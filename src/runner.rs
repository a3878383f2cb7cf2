//! One-shot execution of the wrapped CLI
//!
//! Commands run to completion with stdout and stderr merged into a single
//! text stream in arrival order. A non-zero exit is a normal result, not an
//! error; callers that need bounded latency wrap the call in a timeout
//! (dropping the future kills the child).

use crate::config::GatewayConfig;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Environment variable carrying the state directory
pub const STATE_DIR_ENV: &str = "GATEWAY_STATE_DIR";
/// Environment variable carrying the workspace directory
pub const WORKSPACE_DIR_ENV: &str = "GATEWAY_WORKSPACE_DIR";
/// Environment variable carrying the configuration artifact path
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG_PATH";
/// Environment variable carrying the gateway bearer token
pub const TOKEN_ENV: &str = "GATEWAY_TOKEN";

/// Exit code reported when the command could not be launched at all
pub const LAUNCH_FAILURE_EXIT_CODE: i32 = 127;

/// Result of running a command to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutput {
    pub exit_code: i32,
    /// Interleaved stdout and stderr
    pub output: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Environment shared by the gateway server and every CLI call
pub fn cli_env(gateway: &GatewayConfig) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = gateway
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    env.push((STATE_DIR_ENV.to_string(), gateway.state_dir.display().to_string()));
    env.push((WORKSPACE_DIR_ENV.to_string(), gateway.workspace_dir.display().to_string()));
    env.push((CONFIG_PATH_ENV.to_string(), gateway.config_path().display().to_string()));
    env.push((TOKEN_ENV.to_string(), gateway.token().to_string()));
    env
}

/// Full argv (after the executable) for a CLI subcommand
pub fn cli_args<S: AsRef<str>>(gateway: &GatewayConfig, args: &[S]) -> Vec<String> {
    gateway
        .base_args
        .iter()
        .cloned()
        .chain(args.iter().map(|a| a.as_ref().to_string()))
        .collect()
}

/// Run a subcommand of the wrapped CLI with the shared environment
pub async fn run_cli<S: AsRef<str>>(gateway: &GatewayConfig, args: &[S]) -> RunOutput {
    run_command(&gateway.command, &cli_args(gateway, args), &cli_env(gateway)).await
}

/// Run `program` with `args` and an environment overlay until it exits
pub async fn run_command(program: &str, args: &[String], env: &[(String, String)]) -> RunOutput {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(program, error = %e, "Failed to launch command");
            return RunOutput {
                exit_code: LAUNCH_FAILURE_EXIT_CODE,
                output: format!("[spawn error] {}: {}\n", program, e),
            };
        }
    };

    debug!(program, pid = child.id().unwrap_or(0), "Command started");

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_pump = pump_lines(stdout, tx.clone());
    let stderr_pump = pump_lines(stderr, tx);

    let collect = async {
        let mut output = String::new();
        while let Some(chunk) = rx.recv().await {
            output.push_str(&chunk);
        }
        output
    };

    let (status, _, _, mut output) = tokio::join!(child.wait(), stdout_pump, stderr_pump, collect);

    let exit_code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            output.push_str(&format!("[wait error] {}\n", e));
            -1
        }
    };

    debug!(program, exit_code, "Command finished");
    RunOutput { exit_code, output }
}

/// Forward a pipe into the shared channel one line at a time
async fn pump_lines<R>(pipe: Option<R>, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                    break;
                }
            }
        }
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    -1
}
