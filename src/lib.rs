//! Hot-plug Harness - NVMe-oF to virtio-blk orchestration and validation
//!
//! Drives an SPDK storage target, an IPU that remotes its volumes as
//! virtio-blk devices, and the host that consumes them, through hot-plug
//! scenarios with capacity limits. Also stresses pod delete/recreate cycles
//! on Kubernetes while checking pod-to-pod connectivity.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              Scenarios                                       │
//! │  ┌──────────────────────────────────────┐  ┌─────────────────────────────┐  │
//! │  │ Hot-plug: baseline / at-capacity /   │  │ Pod stress                  │  │
//! │  │           above-capacity             │  │ (delete/recreate + ping)    │  │
//! │  └──────────────────┬───────────────────┘  └──────────────┬──────────────┘  │
//! ├─────────────────────┼─────────────────────────────────────┼─────────────────┤
//! │                Platform Adapters                    Pod Lifecycle           │
//! │  ┌──────────────┐ ┌──────────────┐ ┌────────────┐ ┌─────────────────────┐   │
//! │  │ Storage      │ │ Device       │ │ Host       │ │ PodApi              │   │
//! │  │ (SPDK)       │ │ Remoting(IPU)│ │ (virtio)   │ │ (kube / in-memory)  │   │
//! │  └──────┬───────┘ └──────┬───────┘ └─────┬──────┘ └─────────────────────┘   │
//! ├─────────┼────────────────┼───────────────┼──────────────────────────────────┤
//! │         └────────────────┼───────────────┘                                   │
//! │               Command Channel (local / ssh, optional jump host)              │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`channel`]: Remote command execution
//! - [`config`]: Harness configuration
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling
//! - [`platform`]: Storage target, device remoting and host adapters
//! - [`pods`]: Pod lifecycle utility
//! - [`poll`]: Bounded polling for asynchronously propagating state
//! - [`scenario`]: Hot-plug and pod stress scenarios

pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod platform;
pub mod pods;
pub mod poll;
pub mod scenario;

// Re-export commonly used types
pub use channel::{LocalCommandChannel, SshCommandChannel};

pub use config::{HarnessConfig, PodStressConfig, PollSettings};

pub use domain::ports::{
    DeviceHandle, ExecutionEnvironment, ServiceAddress, Subsystem, VolumeRef, WorkloadConfig,
    CommandChannel, DeviceRemotingPlatform, HostTargetPlatform, PodApi, StorageTargetPlatform,
};

pub use error::{Error, ErrorCategory, Result};

pub use platform::{DeviceLedger, PlatformFactory, PlatformSet, SimulatedTestbed};

pub use pods::{InMemoryPodApi, KubePodApi, PodLifecycle};

pub use poll::{poll_until, PollPolicy};

pub use scenario::{HotPlugRunner, HotPlugScenario, PodStressScenario, ScenarioReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
