//! Local process channel
//!
//! Runs commands on the machine executing the harness. The endpoint name is
//! only used for logging and error messages.

use super::run_process;
use crate::domain::ports::CommandChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Runs argv directly with `tokio::process`
#[derive(Debug, Clone)]
pub struct LocalCommandChannel {
    timeout: Duration,
}

impl LocalCommandChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandChannel for LocalCommandChannel {
    async fn send(&self, endpoint: &str, argv: &[String]) -> Result<String> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::Transport {
            endpoint: endpoint.to_string(),
            reason: "empty command".to_string(),
        })?;
        run_process(endpoint, program, args, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::argv;
    use assert_matches::assert_matches;

    fn channel() -> LocalCommandChannel {
        LocalCommandChannel::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = channel().send("local", &argv(["echo", "hello"])).await.unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_error() {
        let result = channel()
            .send("local", &argv(["sh", "-c", "echo oops >&2; exit 3"]))
            .await;
        assert_matches!(
            result,
            Err(Error::Command { status: 3, ref stderr, .. }) if stderr == "oops"
        );
    }

    #[tokio::test]
    async fn test_missing_program_is_transport_error() {
        let result = channel()
            .send("local", &argv(["/nonexistent/definitely-not-here"]))
            .await;
        assert_matches!(result, Err(Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let channel = LocalCommandChannel::new(Duration::from_millis(50));
        let result = channel.send("local", &argv(["sleep", "5"])).await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let result = channel().send("local", &[]).await;
        assert_matches!(result, Err(Error::Transport { .. }));
    }
}
