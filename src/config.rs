//! Harness Configuration
//!
//! Everything the harness needs is injected through [`HarnessConfig`]:
//! capacity limits, ports, endpoints, workload parameters and polling.
//! It is loaded from YAML and validated once; nothing is held in globals.

use crate::domain::ports::{ExecutionEnvironment, ServiceAddress, WorkloadConfig};
use crate::error::{Error, Result};
use crate::poll::PollPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

// =============================================================================
// Endpoints
// =============================================================================

/// How to reach one remote machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Hostname or IP
    pub address: String,
    /// SSH user
    pub user: Option<String>,
    /// SSH port
    pub port: Option<u16>,
    /// Name of another endpoint to jump through
    pub jump: Option<String>,
    /// SSH identity file
    pub identity_file: Option<PathBuf>,
}

// =============================================================================
// Actor Configuration
// =============================================================================

/// Storage target (SPDK) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageTargetConfig {
    /// Endpoint name in [`HarnessConfig::endpoints`]
    pub endpoint: String,
    /// Address the NVMe/TCP listener binds to
    pub target_address: String,
    /// Process name expected on the NVMe port
    pub process_name: String,
    /// Command that starts the target detached
    pub start_command: Vec<String>,
    /// Command that starts the JSON-RPC HTTP proxy; `{port}` is substituted
    pub rpc_proxy_command: Vec<String>,
    /// Basic-auth user for the RPC proxy
    pub rpc_user: Option<String>,
    /// Basic-auth password for the RPC proxy
    pub rpc_password: Option<String>,
    /// Size of each malloc bdev in MiB
    pub malloc_size_mb: u64,
    /// Block size of each malloc bdev
    pub malloc_block_size: u32,
    /// Max wait for the management service to come up
    pub startup_timeout_secs: u64,
}

impl Default for StorageTargetConfig {
    fn default() -> Self {
        Self {
            endpoint: "storage".to_string(),
            target_address: "127.0.0.1".to_string(),
            process_name: "spdk_tgt".to_string(),
            start_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "nohup spdk_tgt -m 0x3 >/var/log/spdk_tgt.log 2>&1 &".to_string(),
            ],
            rpc_proxy_command: vec![
                "sh".to_string(),
                "-c".to_string(),
                "nohup rpc_http_proxy.py 0.0.0.0 {port} spdk spdk >/var/log/spdk_rpc.log 2>&1 &"
                    .to_string(),
            ],
            rpc_user: Some("spdk".to_string()),
            rpc_password: Some("spdk".to_string()),
            malloc_size_mb: 64,
            malloc_block_size: 512,
            startup_timeout_secs: 30,
        }
    }
}

/// IPU (storage management agent) settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpuConfig {
    /// Endpoint name in [`HarnessConfig::endpoints`]
    pub endpoint: String,
    /// SMA client executable on the IPU
    pub sma_client: String,
    /// Address the SMA server listens on
    pub sma_address: String,
    /// SMA server port
    pub sma_port: u16,
}

impl Default for IpuConfig {
    fn default() -> Self {
        Self {
            endpoint: "ipu".to_string(),
            sma_client: "sma-client.py".to_string(),
            sma_address: "127.0.0.1".to_string(),
            sma_port: 8080,
        }
    }
}

/// Consumer host settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Endpoint name in [`HarnessConfig::endpoints`]
    pub endpoint: String,
    /// Endpoint of the hypervisor when the host is a guest VM
    pub hypervisor_endpoint: Option<String>,
    /// Attach target handed to the IPU
    pub service_address: ServiceAddress,
    /// Block device name prefix of remoted devices
    pub device_prefix: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            endpoint: "host".to_string(),
            hypervisor_endpoint: None,
            service_address: ServiceAddress {
                host: "127.0.0.1".to_string(),
                port: 50051,
            },
            device_prefix: "vd".to_string(),
        }
    }
}

/// fio parameters shared by every access pattern
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadDefaults {
    pub common: BTreeMap<String, String>,
    pub io_patterns: Vec<String>,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        let common = [
            ("runtime", "1"),
            ("numjobs", "1"),
            ("time_based", "1"),
            ("group_reporting", "1"),
            ("iodepth", "8"),
            ("bs", "4k"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            common,
            io_patterns: ["RANDRW", "RANDREAD", "RANDWRITE", "READ", "WRITE", "RW"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl WorkloadDefaults {
    /// One workload config per access pattern, common params merged in
    pub fn workloads(&self) -> Vec<WorkloadConfig> {
        let base = WorkloadConfig::new(self.common.clone());
        self.io_patterns
            .iter()
            .map(|pattern| base.with_pattern(pattern))
            .collect()
    }
}

/// Pod stress scenario settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PodStressConfig {
    pub namespace: String,
    /// Delete/recreate cycles
    #[serde(alias = "no_of_times")]
    pub iterations: u32,
    /// Echo requests per ping check
    pub ping_count: u32,
}

impl Default for PodStressConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            iterations: 10,
            ping_count: 10,
        }
    }
}

/// Bounded polling used wherever state propagates asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_attempts: 20,
        }
    }
}

impl PollSettings {
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.interval_ms), self.max_attempts)
    }
}

// =============================================================================
// Harness Configuration
// =============================================================================

/// Top-level configuration for one harness run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Execution environment
    pub environment: ExecutionEnvironment,
    /// Subsystem qualified name
    pub nqn: String,
    /// NVMe/TCP port
    pub nvme_port: u16,
    /// Management (JSON-RPC) port
    #[serde(alias = "spdk_port")]
    pub management_port: u16,
    /// Minimum batch size
    pub min_ramdrive: usize,
    /// Capacity ceiling
    pub max_ramdrive: usize,
    /// Per-command timeout in seconds
    pub command_timeout_secs: u64,
    /// Remote machines by name
    pub endpoints: BTreeMap<String, EndpointConfig>,
    pub storage: StorageTargetConfig,
    pub ipu: IpuConfig,
    pub host: HostConfig,
    pub workload: WorkloadDefaults,
    pub pod_stress: PodStressConfig,
    pub poll: PollSettings,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            environment: ExecutionEnvironment::Simulated,
            nqn: "nqn.2016-06.io.spdk:cnode0".to_string(),
            nvme_port: 4420,
            management_port: 5260,
            min_ramdrive: 2,
            max_ramdrive: 8,
            command_timeout_secs: 60,
            endpoints: BTreeMap::new(),
            storage: StorageTargetConfig::default(),
            ipu: IpuConfig::default(),
            host: HostConfig::default(),
            workload: WorkloadDefaults::default(),
            pod_stress: PodStressConfig::default(),
            poll: PollSettings::default(),
        }
    }
}

impl HarnessConfig {
    /// Load and validate a YAML config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading harness config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let config: HarnessConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no scenario can run with
    pub fn validate(&self) -> Result<()> {
        if self.nqn.trim().is_empty() {
            return Err(Error::Configuration("nqn must not be empty".into()));
        }
        if self.min_ramdrive == 0 {
            return Err(Error::Configuration("min_ramdrive must be at least 1".into()));
        }
        if self.min_ramdrive > self.max_ramdrive {
            return Err(Error::Configuration(format!(
                "min_ramdrive ({}) exceeds max_ramdrive ({})",
                self.min_ramdrive, self.max_ramdrive
            )));
        }
        if self.nvme_port == self.management_port {
            return Err(Error::Configuration(format!(
                "nvme_port and management_port are both {}",
                self.nvme_port
            )));
        }
        if self.workload.io_patterns.is_empty() {
            return Err(Error::Configuration("workload.io_patterns is empty".into()));
        }
        if self.poll.max_attempts == 0 {
            return Err(Error::Configuration("poll.max_attempts must be at least 1".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(Error::Configuration("command_timeout_secs must be positive".into()));
        }

        if self.environment != ExecutionEnvironment::Simulated {
            for name in [&self.storage.endpoint, &self.ipu.endpoint, &self.host.endpoint] {
                self.endpoint(name)?;
            }
            if self.environment == ExecutionEnvironment::Virtualized {
                let hypervisor = self.host.hypervisor_endpoint.as_ref().ok_or_else(|| {
                    Error::Configuration(
                        "virtualized environment requires host.hypervisor_endpoint".into(),
                    )
                })?;
                self.endpoint(hypervisor)?;
            }
        }

        Ok(())
    }

    /// Look up an endpoint by name
    pub fn endpoint(&self, name: &str) -> Result<&EndpointConfig> {
        self.endpoints
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown endpoint: {}", name)))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
