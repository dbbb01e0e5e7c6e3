//! Storage Target Platform (SPDK)
//!
//! Brings up `spdk_tgt` and its JSON-RPC HTTP proxy on the storage
//! endpoint, exports an NVMe/TCP subsystem and backs it with malloc bdevs.
//! Process and port control go over the command channel; management calls
//! go to the RPC proxy over HTTP.

use crate::channel::argv;
use crate::config::StorageTargetConfig;
use crate::domain::ports::{CommandChannelRef, StorageTargetPlatform, Subsystem, VolumeRef};
use crate::error::{Error, Result};
use crate::poll::{poll_until, PollPolicy};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Serial number given to every created subsystem
const SUBSYSTEM_SERIAL: &str = "SPDK00000000000001";

// =============================================================================
// JSON-RPC Client
// =============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

/// Client for SPDK's JSON-RPC HTTP proxy
#[derive(Debug)]
pub struct SpdkRpcClient {
    http: reqwest::Client,
    url: String,
    credentials: Option<(String, String)>,
    next_id: AtomicU64,
}

impl SpdkRpcClient {
    pub fn new(
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: format!("http://{}:{}/", host, port),
            credentials,
            next_id: AtomicU64::new(1),
        })
    }

    /// Invoke a method and decode its result
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut body = json!({ "jsonrpc": "2.0", "id": id, "method": method });
        if !params.is_null() {
            body["params"] = params;
        }

        debug!("RPC {} -> {}", method, self.url);
        let mut request = self.http.post(&self.url).json(&body);
        if let Some((user, password)) = &self.credentials {
            request = request.basic_auth(user, Some(password));
        }
        let response: RpcResponse = request.send().await?.error_for_status()?.json().await?;

        if let Some(err) = response.error {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}

// =============================================================================
// SPDK Storage Target
// =============================================================================

#[derive(Debug, Default)]
struct TargetState {
    started: bool,
    subsystem: Option<Subsystem>,
    bdevs: Vec<String>,
}

/// NVMe-oF storage target driven through SPDK
pub struct SpdkStorageTarget {
    channel: CommandChannelRef,
    endpoint: String,
    rpc_host: String,
    config: StorageTargetConfig,
    startup: PollPolicy,
    rpc_timeout: Duration,
    state: RwLock<TargetState>,
}

impl SpdkStorageTarget {
    pub fn new(
        channel: CommandChannelRef,
        rpc_host: impl Into<String>,
        config: StorageTargetConfig,
        startup: PollPolicy,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            endpoint: config.endpoint.clone(),
            rpc_host: rpc_host.into(),
            config,
            startup,
            rpc_timeout,
            state: RwLock::new(TargetState::default()),
        }
    }

    fn rpc(&self, management_port: u16) -> Result<SpdkRpcClient> {
        let credentials = match (&self.config.rpc_user, &self.config.rpc_password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        SpdkRpcClient::new(&self.rpc_host, management_port, credentials, self.rpc_timeout)
    }

    async fn listeners(&self, port: u16, with_process: bool) -> Result<Vec<String>> {
        let filter = format!("sport = :{}", port);
        let cmd = if with_process {
            argv(["ss", "-H", "-t", "-l", "-n", "-p", filter.as_str()])
        } else {
            argv(["ss", "-H", "-t", "-l", "-n", filter.as_str()])
        };
        let output = self.channel.send(&self.endpoint, &cmd).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn wait_for_management(&self, rpc: &SpdkRpcClient) -> Result<()> {
        let probe = poll_until(&self.startup, "SPDK management service up", || async move {
            match rpc.call::<Value>("spdk_get_version", Value::Null).await {
                Ok(version) => Ok(Some(version)),
                Err(e) if e.is_transport() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await;

        match probe {
            Ok(version) => {
                info!("SPDK management service is up: {}", version);
                Ok(())
            }
            Err(Error::PollTimeout { attempts, .. }) => Err(Error::Startup {
                component: self.config.process_name.clone(),
                reason: format!(
                    "management service not reachable after {} attempts",
                    attempts
                ),
            }),
            Err(e) => Err(e),
        }
    }

    /// pkill exits 1 when nothing matched
    async fn stop_process(&self, pattern: &str) -> Result<()> {
        match self
            .channel
            .send(&self.endpoint, &argv(["pkill", "-f", pattern]))
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Command { status: 1, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl StorageTargetPlatform for SpdkStorageTarget {
    async fn is_port_free(&self, port: u16) -> Result<bool> {
        Ok(self.listeners(port, false).await?.is_empty())
    }

    async fn is_app_listening_on_port(&self, process_name: &str, port: u16) -> Result<bool> {
        let marker = format!("((\"{}\",", process_name);
        Ok(self
            .listeners(port, true)
            .await?
            .iter()
            .any(|line| line.contains(&marker)))
    }

    async fn create_subsystem(
        &self,
        nqn: &str,
        nvme_port: u16,
        management_port: u16,
    ) -> Result<Subsystem> {
        info!(
            "Creating subsystem {} on port {} (management port {})",
            nqn, nvme_port, management_port
        );

        self.channel
            .send(&self.endpoint, &self.config.start_command)
            .await?;
        let proxy: Vec<String> = self
            .config
            .rpc_proxy_command
            .iter()
            .map(|a| a.replace("{port}", &management_port.to_string()))
            .collect();
        self.channel.send(&self.endpoint, &proxy).await?;
        self.state.write().await.started = true;

        let rpc = self.rpc(management_port)?;
        self.wait_for_management(&rpc).await?;

        match rpc
            .call::<Value>("nvmf_create_transport", json!({ "trtype": "TCP" }))
            .await
        {
            Ok(_) => {}
            Err(Error::Rpc { ref message, .. }) if message.contains("already exists") => {
                debug!("TCP transport already exists");
            }
            Err(e) => return Err(e),
        }

        rpc.call::<Value>(
            "nvmf_create_subsystem",
            json!({
                "nqn": nqn,
                "allow_any_host": true,
                "serial_number": SUBSYSTEM_SERIAL,
            }),
        )
        .await?;

        rpc.call::<Value>(
            "nvmf_subsystem_add_listener",
            json!({
                "nqn": nqn,
                "listen_address": {
                    "trtype": "TCP",
                    "adrfam": "IPv4",
                    "traddr": self.config.target_address,
                    "trsvcid": nvme_port.to_string(),
                },
            }),
        )
        .await?;

        let subsystem = Subsystem {
            nqn: nqn.to_string(),
            target_address: self.config.target_address.clone(),
            nvme_port,
            management_port,
        };
        self.state.write().await.subsystem = Some(subsystem.clone());
        Ok(subsystem)
    }

    async fn create_ramdrives(
        &self,
        count: usize,
        nvme_port: u16,
        nqn: &str,
        management_port: u16,
    ) -> Result<Vec<VolumeRef>> {
        info!("Creating {} ramdrives under {}", count, nqn);
        let rpc = self.rpc(management_port)?;
        let block_size = u64::from(self.config.malloc_block_size);
        let num_blocks = self.config.malloc_size_mb * 1024 * 1024 / block_size;

        let mut state = self.state.write().await;
        let start = state.bdevs.len();
        let mut volumes = Vec::with_capacity(count);

        for index in 0..count {
            let requested = format!("Malloc{}", start + index);
            let bdev_name: String = rpc
                .call(
                    "bdev_malloc_create",
                    json!({
                        "name": requested,
                        "num_blocks": num_blocks,
                        "block_size": block_size,
                    }),
                )
                .await?;
            state.bdevs.push(bdev_name.clone());

            let nsid: u32 = rpc
                .call(
                    "nvmf_subsystem_add_ns",
                    json!({ "nqn": nqn, "namespace": { "bdev_name": bdev_name } }),
                )
                .await?;

            debug!("Volume {} -> {} (nsid {})", index, bdev_name, nsid);
            volumes.push(VolumeRef {
                index,
                bdev_name,
                nsid,
                nqn: nqn.to_string(),
                target_address: self.config.target_address.clone(),
                nvme_port,
            });
        }

        Ok(volumes)
    }

    async fn clean(&self) -> Result<()> {
        let mut state = self.state.write().await;

        if let Some(subsystem) = state.subsystem.take() {
            match self.rpc(subsystem.management_port) {
                Ok(rpc) => {
                    if let Err(e) = rpc
                        .call::<Value>("nvmf_delete_subsystem", json!({ "nqn": subsystem.nqn }))
                        .await
                    {
                        warn!("Deleting subsystem {} failed: {}", subsystem.nqn, e);
                    }
                    for bdev in state.bdevs.drain(..) {
                        if let Err(e) = rpc
                            .call::<Value>("bdev_malloc_delete", json!({ "name": bdev }))
                            .await
                        {
                            warn!("Deleting bdev {} failed: {}", bdev, e);
                        }
                    }
                }
                Err(e) => warn!("No RPC client for cleanup: {}", e),
            }
        }
        state.bdevs.clear();

        if state.started {
            let proxy = self.stop_process("rpc_http_proxy").await;
            let target = self.stop_process(&self.config.process_name).await;
            // a target that survived pkill is still ours to stop
            state.started = target.is_err();
            proxy.and(target)?;
            info!("Storage target stopped");
        }
        Ok(())
    }
}
