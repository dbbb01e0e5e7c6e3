//! Simulated Testbed
//!
//! In-memory storage target, IPU and host sharing one state, used by the
//! `simulated` execution environment and by unit tests. The simulated IPU
//! enforces a hardware slot limit of its own, independent of the ceiling
//! configured on [`IpuStoragePlatform`](super::remoting::IpuStoragePlatform).

use crate::domain::ports::{
    DetachOutcome, HostTargetPlatform, RemotingBackend, ServiceAddress, StorageTargetPlatform,
    Subsystem, VolumeRef, WorkloadConfig, WorkloadRunner,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Process name the simulated target reports on its NVMe port
pub const SIMULATED_TARGET_PROCESS: &str = "spdk_tgt";

const SIMULATED_RPC_PROCESS: &str = "rpc_http_proxy";

#[derive(Debug, Default)]
struct SimState {
    listening: BTreeMap<u16, String>,
    subsystem: Option<Subsystem>,
    volumes: Vec<VolumeRef>,
    devices: BTreeMap<String, (ServiceAddress, VolumeRef)>,
    failing_patterns: BTreeSet<String>,
    next_device: u64,
    attach_calls: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Shared in-memory world for the three simulated actors
#[derive(Clone)]
pub struct SimulatedTestbed {
    state: Arc<Mutex<SimState>>,
    hardware_slots: usize,
    host_address: ServiceAddress,
}

impl SimulatedTestbed {
    pub fn new(hardware_slots: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            hardware_slots,
            host_address: ServiceAddress {
                host: "sim-host".to_string(),
                port: 50051,
            },
        }
    }

    pub fn storage(&self) -> Arc<SimulatedStorageTarget> {
        Arc::new(SimulatedStorageTarget {
            testbed: self.clone(),
        })
    }

    pub fn remoting_backend(&self) -> Arc<SimulatedRemotingBackend> {
        Arc::new(SimulatedRemotingBackend {
            testbed: self.clone(),
        })
    }

    pub fn host(&self) -> Arc<SimulatedHostTarget> {
        Arc::new(SimulatedHostTarget {
            testbed: self.clone(),
        })
    }

    /// Address the simulated host accepts devices on
    pub fn host_address(&self) -> ServiceAddress {
        self.host_address.clone()
    }

    /// Make workloads with this access pattern report failure
    pub fn fail_pattern(&self, pattern: &str) {
        self.state
            .lock()
            .failing_patterns
            .insert(pattern.to_lowercase());
    }

    /// Register volumes directly, bypassing the storage target
    pub fn seed_volumes(&self, nqn: &str, count: usize) -> Vec<VolumeRef> {
        let mut state = self.state.lock();
        let start = state.volumes.len();
        let created: Vec<VolumeRef> = (0..count)
            .map(|i| simulated_volume(nqn, start + i, i, 4420))
            .collect();
        state.volumes.extend(created.iter().cloned());
        created
    }

    /// Devices visible on any host
    pub fn device_count(&self) -> usize {
        self.state.lock().devices.len()
    }

    /// Total attach calls received
    pub fn attach_calls(&self) -> usize {
        self.state.lock().attach_calls
    }

    /// Highest number of attach calls observed in flight at once
    pub fn max_concurrent_attaches(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

fn simulated_volume(nqn: &str, bdev_index: usize, index: usize, nvme_port: u16) -> VolumeRef {
    VolumeRef {
        index,
        bdev_name: format!("Malloc{}", bdev_index),
        nsid: bdev_index as u32 + 1,
        nqn: nqn.to_string(),
        target_address: "sim-target".to_string(),
        nvme_port,
    }
}

// =============================================================================
// Storage Target
// =============================================================================

pub struct SimulatedStorageTarget {
    testbed: SimulatedTestbed,
}

#[async_trait]
impl StorageTargetPlatform for SimulatedStorageTarget {
    async fn is_port_free(&self, port: u16) -> Result<bool> {
        Ok(!self.testbed.state.lock().listening.contains_key(&port))
    }

    async fn is_app_listening_on_port(&self, process_name: &str, port: u16) -> Result<bool> {
        Ok(self
            .testbed
            .state
            .lock()
            .listening
            .get(&port)
            .map(|p| p == process_name)
            .unwrap_or(false))
    }

    async fn create_subsystem(
        &self,
        nqn: &str,
        nvme_port: u16,
        management_port: u16,
    ) -> Result<Subsystem> {
        let mut state = self.testbed.state.lock();
        for port in [nvme_port, management_port] {
            if let Some(owner) = state.listening.get(&port) {
                return Err(Error::Startup {
                    component: SIMULATED_TARGET_PROCESS.to_string(),
                    reason: format!("port {} already bound by {}", port, owner),
                });
            }
        }

        state
            .listening
            .insert(nvme_port, SIMULATED_TARGET_PROCESS.to_string());
        state
            .listening
            .insert(management_port, SIMULATED_RPC_PROCESS.to_string());

        let subsystem = Subsystem {
            nqn: nqn.to_string(),
            target_address: "sim-target".to_string(),
            nvme_port,
            management_port,
        };
        state.subsystem = Some(subsystem.clone());
        info!("Simulated subsystem {} on port {}", nqn, nvme_port);
        Ok(subsystem)
    }

    async fn create_ramdrives(
        &self,
        count: usize,
        nvme_port: u16,
        nqn: &str,
        _management_port: u16,
    ) -> Result<Vec<VolumeRef>> {
        let mut state = self.testbed.state.lock();
        match &state.subsystem {
            Some(s) if s.nqn == nqn && s.nvme_port == nvme_port => {}
            _ => {
                return Err(Error::ResourceNotFound {
                    kind: "Subsystem".into(),
                    name: nqn.to_string(),
                })
            }
        }

        let start = state.volumes.len();
        let created: Vec<VolumeRef> = (0..count)
            .map(|i| simulated_volume(nqn, start + i, i, nvme_port))
            .collect();
        state.volumes.extend(created.iter().cloned());
        debug!("Simulated {} ramdrives", count);
        Ok(created)
    }

    async fn clean(&self) -> Result<()> {
        let mut state = self.testbed.state.lock();
        state.listening.clear();
        state.subsystem = None;
        state.volumes.clear();
        Ok(())
    }
}

// =============================================================================
// Remoting Backend
// =============================================================================

pub struct SimulatedRemotingBackend {
    testbed: SimulatedTestbed,
}

#[async_trait]
impl WorkloadRunner for SimulatedRemotingBackend {
    async fn run_workload(&self, device_id: &str, config: &WorkloadConfig) -> Result<bool> {
        let state = self.testbed.state.lock();
        if !state.devices.contains_key(device_id) {
            return Err(Error::ResourceNotFound {
                kind: "VirtioBlk".into(),
                name: device_id.to_string(),
            });
        }
        let pattern = config.pattern().unwrap_or_default();
        Ok(!state.failing_patterns.contains(pattern))
    }
}

#[async_trait]
impl RemotingBackend for SimulatedRemotingBackend {
    async fn attach(&self, service_address: &ServiceAddress, volume: &VolumeRef) -> Result<String> {
        {
            let mut state = self.testbed.state.lock();
            state.attach_calls += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        // let any concurrent caller interleave here
        tokio::task::yield_now().await;

        let mut state = self.testbed.state.lock();
        state.in_flight -= 1;

        if !state
            .volumes
            .iter()
            .any(|v| v.nqn == volume.nqn && v.bdev_name == volume.bdev_name)
        {
            return Err(Error::Command {
                endpoint: "sim-ipu".into(),
                command: "create-device".into(),
                status: 1,
                stderr: format!("volume {} is not exported", volume.bdev_name),
            });
        }
        if state.devices.len() >= self.testbed.hardware_slots {
            return Err(Error::Command {
                endpoint: "sim-ipu".into(),
                command: "create-device".into(),
                status: 1,
                stderr: "no free virtio-blk slots".into(),
            });
        }

        let id = format!("virtio_blk:sim-{}", state.next_device);
        state.next_device += 1;
        state
            .devices
            .insert(id.clone(), (service_address.clone(), volume.clone()));
        Ok(id)
    }

    async fn detach(
        &self,
        _service_address: &ServiceAddress,
        device_id: &str,
    ) -> Result<DetachOutcome> {
        match self.testbed.state.lock().devices.remove(device_id) {
            Some(_) => Ok(DetachOutcome::Detached),
            None => Ok(DetachOutcome::AlreadyAbsent),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Host
// =============================================================================

pub struct SimulatedHostTarget {
    testbed: SimulatedTestbed,
}

#[async_trait]
impl HostTargetPlatform for SimulatedHostTarget {
    async fn get_number_of_virtio_blk_devices(&self) -> Result<usize> {
        let address = &self.testbed.host_address;
        Ok(self
            .testbed
            .state
            .lock()
            .devices
            .values()
            .filter(|(addr, _)| addr == address)
            .count())
    }

    fn get_service_address(&self) -> ServiceAddress {
        self.testbed.host_address.clone()
    }

    async fn clean(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_subsystem_occupies_ports() {
        let testbed = SimulatedTestbed::new(8);
        let storage = testbed.storage();

        assert!(storage.is_port_free(4420).await.unwrap());
        storage.create_subsystem("nqn.test", 4420, 5260).await.unwrap();
        assert!(!storage.is_port_free(4420).await.unwrap());
        assert!(storage
            .is_app_listening_on_port(SIMULATED_TARGET_PROCESS, 4420)
            .await
            .unwrap());
        assert!(!storage.is_app_listening_on_port("nginx", 4420).await.unwrap());

        assert_matches!(
            storage.create_subsystem("nqn.other", 4420, 5261).await,
            Err(Error::Startup { .. })
        );

        storage.clean().await.unwrap();
        assert!(storage.is_port_free(4420).await.unwrap());
        storage.clean().await.unwrap();
    }

    #[tokio::test]
    async fn test_ramdrives_require_subsystem() {
        let testbed = SimulatedTestbed::new(8);
        let storage = testbed.storage();

        assert_matches!(
            storage.create_ramdrives(2, 4420, "nqn.test", 5260).await,
            Err(Error::ResourceNotFound { .. })
        );

        storage.create_subsystem("nqn.test", 4420, 5260).await.unwrap();
        let volumes = storage.create_ramdrives(3, 4420, "nqn.test", 5260).await.unwrap();
        assert_eq!(volumes.len(), 3);
        assert_eq!(
            volumes.iter().map(|v| v.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(volumes[2].bdev_name, "Malloc2");
    }

    #[tokio::test]
    async fn test_host_counts_only_its_devices() {
        let testbed = SimulatedTestbed::new(8);
        let backend = testbed.remoting_backend();
        let host = testbed.host();
        let volumes = testbed.seed_volumes("nqn.test", 2);

        let other = ServiceAddress {
            host: "elsewhere".into(),
            port: 1,
        };
        backend.attach(&host.get_service_address(), &volumes[0]).await.unwrap();
        backend.attach(&other, &volumes[1]).await.unwrap();

        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 1);
        assert_eq!(testbed.device_count(), 2);
    }
}
