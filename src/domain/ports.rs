//! Domain Ports - Core trait definitions for the hot-plug harness
//!
//! These traits define the boundaries between the orchestration logic and
//! the three remote actors (storage target, IPU, host) plus the command
//! transport and the Kubernetes pod API. Adapters implement these traits.

use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Execution Environment
// =============================================================================

/// Where the harness runs its actors, chosen once at configuration time
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEnvironment {
    /// Host is a guest VM reached through its hypervisor
    Virtualized,
    /// Host is a physical server reached directly
    BareMetal,
    /// All actors are in-memory
    Simulated,
}

impl std::fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionEnvironment::Virtualized => write!(f, "virtualized"),
            ExecutionEnvironment::BareMetal => write!(f, "bare-metal"),
            ExecutionEnvironment::Simulated => write!(f, "simulated"),
        }
    }
}

// =============================================================================
// Storage Types
// =============================================================================

/// An NVMe-oF export subsystem bound to one port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsystem {
    /// Qualified name (NQN)
    pub nqn: String,
    /// Address the subsystem listens on
    pub target_address: String,
    /// NVMe/TCP listener port
    pub nvme_port: u16,
    /// Management (JSON-RPC) port
    pub management_port: u16,
}

/// A RAM-backed volume exported under a subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Position in the requested batch
    pub index: usize,
    /// Backing bdev name on the target
    pub bdev_name: String,
    /// Namespace id inside the subsystem
    pub nsid: u32,
    /// Owning subsystem NQN
    pub nqn: String,
    /// Target address
    pub target_address: String,
    /// NVMe/TCP port
    pub nvme_port: u16,
}

/// Attach target exposed by the host
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Devices
// =============================================================================

/// Lifecycle state of a remoted block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Absent,
    Creating,
    Attached,
    Deleting,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Absent => write!(f, "absent"),
            DeviceState::Creating => write!(f, "creating"),
            DeviceState::Attached => write!(f, "attached"),
            DeviceState::Deleting => write!(f, "deleting"),
        }
    }
}

/// Result of a single detach call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    Detached,
    AlreadyAbsent,
}

/// Opaque named parameters for the I/O exerciser
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig(pub BTreeMap<String, String>);

impl WorkloadConfig {
    /// Access pattern selector key
    pub const PATTERN_KEY: &'static str = "rw";

    pub fn new(params: BTreeMap<String, String>) -> Self {
        Self(params)
    }

    /// Copy of this config with the access pattern set
    pub fn with_pattern(&self, pattern: &str) -> Self {
        let mut params = self.0.clone();
        params.insert(Self::PATTERN_KEY.to_string(), pattern.to_lowercase());
        Self(params)
    }

    pub fn pattern(&self) -> Option<&str> {
        self.0.get(Self::PATTERN_KEY).map(String::as_str)
    }
}

/// Runs an I/O workload against a device by id
#[async_trait]
pub trait WorkloadRunner: Send + Sync {
    async fn run_workload(&self, device_id: &str, config: &WorkloadConfig) -> Result<bool>;
}

/// Handle to a remoted block device, owned by the remoting platform
#[derive(Clone)]
pub struct DeviceHandle {
    /// Device id assigned by the remoting layer
    pub id: String,
    /// Index of the backing volume in its batch
    pub index: usize,
    /// Backing volume
    pub volume: VolumeRef,
    /// Host the device was attached to
    pub service_address: ServiceAddress,
    runner: Arc<dyn WorkloadRunner>,
}

impl DeviceHandle {
    pub fn new(
        id: impl Into<String>,
        volume: VolumeRef,
        service_address: ServiceAddress,
        runner: Arc<dyn WorkloadRunner>,
    ) -> Self {
        Self {
            id: id.into(),
            index: volume.index,
            volume,
            service_address,
            runner,
        }
    }

    /// Run an I/O exercise against this device
    pub async fn run_workload(&self, config: &WorkloadConfig) -> Result<bool> {
        self.runner.run_workload(&self.id, config).await
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("index", &self.index)
            .field("bdev", &self.volume.bdev_name)
            .field("service_address", &self.service_address)
            .finish()
    }
}

// =============================================================================
// Command Channel Port
// =============================================================================

/// Sends a command to a named endpoint and returns its captured stdout
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn send(&self, endpoint: &str, argv: &[String]) -> Result<String>;
}

// =============================================================================
// Platform Ports
// =============================================================================

/// Port for the NVMe-oF storage target
#[async_trait]
pub trait StorageTargetPlatform: Send + Sync {
    /// Check whether nothing is bound to the TCP port
    async fn is_port_free(&self, port: u16) -> Result<bool>;

    /// Check whether the named process listens on the TCP port
    async fn is_app_listening_on_port(&self, process_name: &str, port: u16) -> Result<bool>;

    /// Bring up the target process, its management service and the subsystem
    async fn create_subsystem(
        &self,
        nqn: &str,
        nvme_port: u16,
        management_port: u16,
    ) -> Result<Subsystem>;

    /// Create `count` RAM-backed volumes under the subsystem
    async fn create_ramdrives(
        &self,
        count: usize,
        nvme_port: u16,
        nqn: &str,
        management_port: u16,
    ) -> Result<Vec<VolumeRef>>;

    /// Release everything this platform created
    async fn clean(&self) -> Result<()>;
}

/// Port for the device remoting intermediary (IPU)
#[async_trait]
pub trait DeviceRemotingPlatform: Send + Sync {
    /// Attach every volume in order, one call at a time
    async fn create_virtio_blk_devices_sequentially(
        &self,
        service_address: &ServiceAddress,
        volumes: &[VolumeRef],
    ) -> Result<Vec<DeviceHandle>>;

    /// Delete every handle, one flag per handle
    async fn delete_virtio_blk_devices(&self, handles: &[DeviceHandle]) -> Result<Vec<bool>>;

    /// Configured capacity ceiling
    fn capacity_ceiling(&self) -> usize;

    /// Tear down remoting state
    async fn clean(&self) -> Result<()>;
}

/// Per-device primitives a remoting platform is built on
#[async_trait]
pub trait RemotingBackend: WorkloadRunner {
    /// Attach one volume, returning the new device id
    async fn attach(&self, service_address: &ServiceAddress, volume: &VolumeRef) -> Result<String>;

    /// Detach one device by id
    async fn detach(&self, service_address: &ServiceAddress, device_id: &str)
        -> Result<DetachOutcome>;

    /// Drop initiator connections
    async fn disconnect(&self) -> Result<()>;
}

/// Port for the consumer host
#[async_trait]
pub trait HostTargetPlatform: Send + Sync {
    /// Number of virtio-blk devices currently visible
    async fn get_number_of_virtio_blk_devices(&self) -> Result<usize>;

    /// Attach target for the remoting platform
    fn get_service_address(&self) -> ServiceAddress;

    /// Release host-side reservations
    async fn clean(&self) -> Result<()>;
}

// =============================================================================
// Pod API Port
// =============================================================================

/// Narrow view of the Kubernetes pod API
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<()>;

    /// Delete a pod; a missing pod is `ResourceNotFound`
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;

    /// List pods across all namespaces
    async fn list_pods(&self) -> Result<Vec<Pod>>;

    /// Execute a command inside a pod and return stdout
    async fn exec(&self, namespace: &str, name: &str, command: &[String]) -> Result<String>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandChannelRef = Arc<dyn CommandChannel>;
pub type StorageTargetRef = Arc<dyn StorageTargetPlatform>;
pub type DeviceRemotingRef = Arc<dyn DeviceRemotingPlatform>;
pub type RemotingBackendRef = Arc<dyn RemotingBackend>;
pub type HostTargetRef = Arc<dyn HostTargetPlatform>;
pub type PodApiRef = Arc<dyn PodApi>;
