//! Command Channel
//!
//! Sends argv-style commands to named endpoints and returns captured
//! stdout. Every invocation is bounded by a timeout; non-zero exits become
//! [`Error::Command`], spawn failures [`Error::Transport`], expiry
//! [`Error::Timeout`]. Nothing here retries.

pub mod local;
pub mod ssh;

#[cfg(test)]
pub(crate) mod scripted;

pub use local::*;
pub use ssh::*;

use crate::error::{Error, Result};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Run a local process with a timeout and map its outcome
pub(crate) async fn run_process(
    endpoint: &str,
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<String> {
    let rendered = render_command(program, args);
    debug!("[{}] $ {}", endpoint, rendered);

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("{} on {}", rendered, endpoint),
            timeout,
        })?
        .map_err(|e| Error::Transport {
            endpoint: endpoint.to_string(),
            reason: format!("failed to spawn {}: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(Error::Command {
            endpoint: endpoint.to_string(),
            command: rendered,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(shell_quote)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Build an owned argv from string slices
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}
