//! Platform Adapters
//!
//! Provides the three actors a hot-plug scenario drives:
//! - Storage target: SPDK NVMe-oF export ([`SpdkStorageTarget`])
//! - Device remoting: IPU storage management agent ([`IpuStoragePlatform`])
//! - Host target: virtio-blk consumer ([`SysfsHostTarget`])
//!
//! plus an in-memory [`SimulatedTestbed`] implementing all three.

pub mod host;
pub mod ledger;
pub mod remoting;
pub mod simulated;
pub mod storage;

pub use host::*;
pub use ledger::*;
pub use remoting::*;
pub use simulated::*;
pub use storage::*;

use crate::channel::{SshCommandChannel, LOCAL_ADDRESS};
use crate::config::HarnessConfig;
use crate::domain::ports::{
    CommandChannelRef, DeviceRemotingRef, ExecutionEnvironment, HostTargetRef, StorageTargetRef,
};
use crate::error::{Error, Result};
use crate::poll::PollPolicy;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The three platform handles one scenario owns
#[derive(Clone)]
pub struct PlatformSet {
    pub environment: ExecutionEnvironment,
    pub storage: StorageTargetRef,
    pub remoting: DeviceRemotingRef,
    pub host: HostTargetRef,
}

/// Builds a [`PlatformSet`] from an injected configuration
pub struct PlatformFactory;

impl PlatformFactory {
    /// Create the platforms for the configured environment
    pub fn create(config: &HarnessConfig) -> Result<PlatformSet> {
        config.validate()?;
        info!("Creating platforms for {} environment", config.environment);

        match config.environment {
            ExecutionEnvironment::Simulated => Ok(Self::simulated(
                config,
                &SimulatedTestbed::new(config.max_ramdrive),
            )),
            ExecutionEnvironment::Virtualized | ExecutionEnvironment::BareMetal => {
                let channel: CommandChannelRef = Arc::new(SshCommandChannel::new(
                    Self::routed_endpoints(config)?,
                    config.command_timeout(),
                ));
                Self::with_channel(config, channel)
            }
        }
    }

    /// Platforms backed by an in-memory testbed
    pub fn simulated(config: &HarnessConfig, testbed: &SimulatedTestbed) -> PlatformSet {
        PlatformSet {
            environment: ExecutionEnvironment::Simulated,
            storage: testbed.storage(),
            remoting: Arc::new(IpuStoragePlatform::new(
                testbed.remoting_backend(),
                config.max_ramdrive,
            )),
            host: testbed.host(),
        }
    }

    /// Command-driven platforms over an explicit channel
    pub fn with_channel(config: &HarnessConfig, channel: CommandChannelRef) -> Result<PlatformSet> {
        let storage_endpoint = config.endpoint(&config.storage.endpoint)?;
        let rpc_host = if storage_endpoint.address == LOCAL_ADDRESS {
            "127.0.0.1".to_string()
        } else {
            storage_endpoint.address.clone()
        };

        let startup = PollPolicy::new(
            config.poll.policy().interval,
            Self::startup_attempts(config),
        );

        let storage = SpdkStorageTarget::new(
            channel.clone(),
            rpc_host,
            config.storage.clone(),
            startup,
            config.command_timeout(),
        );

        let backend = Arc::new(SmaRemotingBackend::new(channel.clone(), config.ipu.clone()));
        let remoting = IpuStoragePlatform::new(backend, config.max_ramdrive);

        let host = SysfsHostTarget::new(
            channel,
            config.host.endpoint.clone(),
            config.host.service_address.clone(),
            config.host.device_prefix.clone(),
        );

        Ok(PlatformSet {
            environment: config.environment,
            storage: Arc::new(storage),
            remoting: Arc::new(remoting),
            host: Arc::new(host),
        })
    }

    /// Endpoint table with the guest VM routed through its hypervisor
    fn routed_endpoints(
        config: &HarnessConfig,
    ) -> Result<std::collections::BTreeMap<String, crate::config::EndpointConfig>> {
        let mut endpoints = config.endpoints.clone();
        if config.environment == ExecutionEnvironment::Virtualized {
            let hypervisor = config.host.hypervisor_endpoint.clone().ok_or_else(|| {
                Error::Configuration("virtualized environment requires a hypervisor".into())
            })?;
            if let Some(host) = endpoints.get_mut(&config.host.endpoint) {
                host.jump = Some(hypervisor);
            }
        }
        Ok(endpoints)
    }

    fn startup_attempts(config: &HarnessConfig) -> u32 {
        let interval = Duration::from_millis(config.poll.interval_ms.max(1));
        let budget = Duration::from_secs(config.storage.startup_timeout_secs);
        (budget.as_millis() / interval.as_millis()).max(1) as u32
    }
}
