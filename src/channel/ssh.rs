//! SSH channel
//!
//! Resolves endpoint names against the configured endpoint table and runs
//! the command through `ssh` in batch mode. Endpoints may hop through a jump
//! host, which is how a guest VM is reached through its hypervisor.
//! Endpoints whose address is `local` run on this machine.

use super::{run_process, shell_quote, LocalCommandChannel};
use crate::config::EndpointConfig;
use crate::domain::ports::CommandChannel;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Address marking an endpoint as the local machine
pub const LOCAL_ADDRESS: &str = "local";

/// SSH connect timeout passed to the client
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Runs commands on remote endpoints via the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshCommandChannel {
    endpoints: BTreeMap<String, EndpointConfig>,
    timeout: Duration,
    local: LocalCommandChannel,
}

impl SshCommandChannel {
    pub fn new(endpoints: BTreeMap<String, EndpointConfig>, timeout: Duration) -> Self {
        Self {
            endpoints,
            timeout,
            local: LocalCommandChannel::new(timeout),
        }
    }

    fn lookup(&self, name: &str) -> Result<&EndpointConfig> {
        self.endpoints.get(name).ok_or_else(|| Error::Transport {
            endpoint: name.to_string(),
            reason: "endpoint not configured".to_string(),
        })
    }

    /// `user@host`, with the port suffix ssh's -J syntax expects
    fn destination(endpoint: &EndpointConfig, with_port: bool) -> String {
        let mut dest = match &endpoint.user {
            Some(user) => format!("{}@{}", user, endpoint.address),
            None => endpoint.address.clone(),
        };
        if with_port {
            if let Some(port) = endpoint.port {
                dest.push_str(&format!(":{}", port));
            }
        }
        dest
    }

    /// Full argument list handed to `ssh`
    pub fn ssh_args(&self, name: &str, argv: &[String]) -> Result<Vec<String>> {
        let endpoint = self.lookup(name)?;

        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS),
        ];
        if let Some(port) = endpoint.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &endpoint.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        if let Some(jump) = &endpoint.jump {
            let hop = self.lookup(jump)?;
            args.push("-J".to_string());
            args.push(Self::destination(hop, true));
        }
        args.push(Self::destination(endpoint, false));
        args.push("--".to_string());
        args.push(
            argv.iter()
                .map(|a| shell_quote(a))
                .collect::<Vec<_>>()
                .join(" "),
        );
        Ok(args)
    }
}

#[async_trait]
impl CommandChannel for SshCommandChannel {
    async fn send(&self, endpoint: &str, argv: &[String]) -> Result<String> {
        if self.lookup(endpoint)?.address == LOCAL_ADDRESS {
            return self.local.send(endpoint, argv).await;
        }
        if argv.is_empty() {
            return Err(Error::Transport {
                endpoint: endpoint.to_string(),
                reason: "empty command".to_string(),
            });
        }

        let args = self.ssh_args(endpoint, argv)?;
        run_process(endpoint, "ssh", &args, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::argv;
    use assert_matches::assert_matches;

    fn endpoints() -> BTreeMap<String, EndpointConfig> {
        let mut map = BTreeMap::new();
        map.insert(
            "kvm".to_string(),
            EndpointConfig {
                address: "10.0.0.5".into(),
                user: Some("root".into()),
                port: Some(2222),
                ..Default::default()
            },
        );
        map.insert(
            "host".to_string(),
            EndpointConfig {
                address: "192.168.122.10".into(),
                user: Some("vm".into()),
                jump: Some("kvm".into()),
                ..Default::default()
            },
        );
        map.insert(
            "here".to_string(),
            EndpointConfig {
                address: LOCAL_ADDRESS.into(),
                ..Default::default()
            },
        );
        map
    }

    #[test]
    fn test_ssh_args_with_jump() {
        let channel = SshCommandChannel::new(endpoints(), Duration::from_secs(5));
        let args = channel
            .ssh_args("host", &argv(["sh", "-c", "ls /sys/block"]))
            .unwrap();

        let jump = args.iter().position(|a| a == "-J").unwrap();
        assert_eq!(args[jump + 1], "root@10.0.0.5:2222");
        assert_eq!(args[args.len() - 3], "vm@192.168.122.10");
        assert_eq!(args[args.len() - 1], "sh -c 'ls /sys/block'");
        assert!(!args.contains(&"-p".to_string()));
    }

    #[test]
    fn test_unknown_endpoint() {
        let channel = SshCommandChannel::new(endpoints(), Duration::from_secs(5));
        assert_matches!(
            channel.ssh_args("storage", &argv(["true"])),
            Err(Error::Transport { .. })
        );
    }

    #[tokio::test]
    async fn test_local_endpoint_runs_in_process() {
        let channel = SshCommandChannel::new(endpoints(), Duration::from_secs(5));
        let out = channel.send("here", &argv(["echo", "local"])).await.unwrap();
        assert_eq!(out.trim(), "local");
    }

    #[tokio::test]
    async fn test_local_endpoint_shares_timeout() {
        let channel = SshCommandChannel::new(endpoints(), Duration::from_millis(50));
        let result = channel.send("here", &argv(["sleep", "5"])).await;
        assert_matches!(result, Err(Error::Timeout { .. }));
    }
}
