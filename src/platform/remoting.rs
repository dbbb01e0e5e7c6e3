//! Device Remoting Platform (IPU)
//!
//! Turns exported volumes into virtio-blk devices on the consumer host.
//! Attaches are issued strictly one at a time and counted against the
//! capacity ceiling; the batch either yields a handle per volume or fails
//! and rolls back whatever it attached. Deletes are idempotent.

use crate::channel::argv;
use crate::config::IpuConfig;
use crate::domain::ports::{
    CommandChannelRef, DetachOutcome, DeviceHandle, DeviceRemotingPlatform, RemotingBackend,
    RemotingBackendRef, ServiceAddress, VolumeRef, WorkloadConfig, WorkloadRunner,
};
use crate::error::{Error, Result};
use crate::platform::ledger::{volume_key, DeleteClaim, DeviceLedger};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

// =============================================================================
// IPU Storage Platform
// =============================================================================

/// Sequential, capacity-bounded remoting over a [`RemotingBackend`]
pub struct IpuStoragePlatform {
    backend: RemotingBackendRef,
    runner: Arc<dyn WorkloadRunner>,
    ceiling: usize,
    ledger: DeviceLedger,
}

impl IpuStoragePlatform {
    pub fn new<B>(backend: Arc<B>, ceiling: usize) -> Self
    where
        B: RemotingBackend + 'static,
    {
        Self {
            backend: backend.clone(),
            runner: backend,
            ceiling,
            ledger: DeviceLedger::new(),
        }
    }

    /// Devices currently attached according to the ledger
    pub fn attached_count(&self) -> usize {
        self.ledger.attached_count()
    }

    async fn attach_one(
        &self,
        service_address: &ServiceAddress,
        volume: &VolumeRef,
    ) -> Result<DeviceHandle> {
        let key = volume_key(volume);
        self.ledger.begin_create(&key, service_address)?;

        match self.backend.attach(service_address, volume).await {
            Ok(device_id) => {
                self.ledger.finish_create(&key, &device_id)?;
                debug!("Attached {} as {}", volume.bdev_name, device_id);
                Ok(DeviceHandle::new(
                    device_id,
                    volume.clone(),
                    service_address.clone(),
                    self.runner.clone(),
                ))
            }
            Err(e) => {
                self.ledger.abort_create(&key);
                Err(e)
            }
        }
    }

    /// Detach one handle; `true` when the device is absent afterwards
    async fn detach_one(&self, handle: &DeviceHandle) -> bool {
        let key = volume_key(&handle.volume);
        let tracked = match self.ledger.begin_delete(&key, &handle.id) {
            Ok(DeleteClaim::Claimed) => true,
            Ok(DeleteClaim::Untracked) => false,
            Ok(DeleteClaim::Superseded) => {
                debug!("Device {} already replaced, nothing to delete", handle.id);
                return true;
            }
            Err(e) => {
                warn!("Cannot delete {}: {}", handle.id, e);
                return false;
            }
        };

        match self.backend.detach(&handle.service_address, &handle.id).await {
            Ok(outcome) => {
                if tracked {
                    self.ledger.finish_delete(&key);
                }
                if outcome == DetachOutcome::AlreadyAbsent {
                    debug!("Device {} already absent", handle.id);
                }
                true
            }
            Err(e) => {
                if tracked {
                    self.ledger.restore(&key);
                }
                warn!("Failed to delete device {}: {}", handle.id, e);
                false
            }
        }
    }

    async fn rollback(&self, created: &[DeviceHandle]) {
        for handle in created.iter().rev() {
            if !self.detach_one(handle).await {
                error!("Rollback left device {} attached", handle.id);
            }
        }
    }
}

#[async_trait]
impl DeviceRemotingPlatform for IpuStoragePlatform {
    async fn create_virtio_blk_devices_sequentially(
        &self,
        service_address: &ServiceAddress,
        volumes: &[VolumeRef],
    ) -> Result<Vec<DeviceHandle>> {
        info!(
            "Attaching {} volumes to {} sequentially (ceiling {})",
            volumes.len(),
            service_address,
            self.ceiling
        );

        let mut created = Vec::with_capacity(volumes.len().min(self.ceiling));
        for volume in volumes {
            if created.len() == self.ceiling {
                warn!(
                    "Capacity ceiling {} reached with {} volumes requested, rolling back",
                    self.ceiling,
                    volumes.len()
                );
                self.rollback(&created).await;
                return Err(Error::CapacityExceeded {
                    requested: volumes.len(),
                    ceiling: self.ceiling,
                });
            }

            match self.attach_one(service_address, volume).await {
                Ok(handle) => created.push(handle),
                Err(e) => {
                    error!("Attach of {} failed: {}", volume.bdev_name, e);
                    self.rollback(&created).await;
                    return Err(e);
                }
            }
        }

        info!("Attached {} devices", created.len());
        Ok(created)
    }

    async fn delete_virtio_blk_devices(&self, handles: &[DeviceHandle]) -> Result<Vec<bool>> {
        info!("Deleting {} devices", handles.len());
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(self.detach_one(handle).await);
        }
        Ok(results)
    }

    fn capacity_ceiling(&self) -> usize {
        self.ceiling
    }

    async fn clean(&self) -> Result<()> {
        let leftovers = self.ledger.attached();
        if !leftovers.is_empty() {
            info!("Detaching {} leftover devices", leftovers.len());
        }

        let mut first_error = None;
        for device in leftovers {
            match self
                .backend
                .detach(&device.service_address, &device.device_id)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("Clean could not detach {}: {}", device.device_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        self.ledger.clear();

        if let Err(e) = self.backend.disconnect().await {
            if !e.is_not_found() {
                warn!("Initiator disconnect failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// =============================================================================
// SMA Backend
// =============================================================================

#[derive(Debug, Deserialize)]
struct CreateDeviceResponse {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct FioReport {
    #[serde(default)]
    jobs: Vec<FioJob>,
}

#[derive(Debug, Deserialize)]
struct FioJob {
    #[serde(default)]
    jobname: String,
    error: i64,
}

/// Drives the IPU's storage management agent through its CLI client
pub struct SmaRemotingBackend {
    channel: CommandChannelRef,
    config: IpuConfig,
    connected: Mutex<BTreeSet<String>>,
}

impl SmaRemotingBackend {
    pub fn new(channel: CommandChannelRef, config: IpuConfig) -> Self {
        Self {
            channel,
            config,
            connected: Mutex::new(BTreeSet::new()),
        }
    }

    fn sma(&self, subcommand: &str) -> Vec<String> {
        argv([
            self.config.sma_client.clone(),
            "--address".to_string(),
            self.config.sma_address.clone(),
            "--port".to_string(),
            self.config.sma_port.to_string(),
            subcommand.to_string(),
        ])
    }
}

fn is_absent_message(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("not found") || lower.contains("no such device")
}

#[async_trait]
impl WorkloadRunner for SmaRemotingBackend {
    async fn run_workload(&self, device_id: &str, config: &WorkloadConfig) -> Result<bool> {
        let mut cmd = self.sma("run-fio");
        cmd.extend(argv([
            "--handle".to_string(),
            device_id.to_string(),
            "--json".to_string(),
            serde_json::to_string(&config.0)?,
        ]));
        let output = self.channel.send(&self.config.endpoint, &cmd).await?;

        let report: FioReport = match serde_json::from_str(&output) {
            Ok(report) => report,
            Err(e) => {
                warn!("Unparseable fio output for {}: {}", device_id, e);
                return Ok(false);
            }
        };
        if report.jobs.is_empty() {
            warn!("fio reported no jobs for {}", device_id);
            return Ok(false);
        }
        for job in &report.jobs {
            if job.error != 0 {
                warn!(
                    "fio job {} on {} failed with error {}",
                    job.jobname, device_id, job.error
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl RemotingBackend for SmaRemotingBackend {
    async fn attach(&self, service_address: &ServiceAddress, volume: &VolumeRef) -> Result<String> {
        let request = serde_json::json!({
            "volume": {
                "nqn": volume.nqn,
                "traddr": volume.target_address,
                "trsvcid": volume.nvme_port.to_string(),
                "nsid": volume.nsid,
            },
            "virtio_blk": {
                "host": service_address.host,
                "port": service_address.port,
            },
        });

        let mut cmd = self.sma("create-device");
        cmd.extend(argv(["--json".to_string(), request.to_string()]));
        let output = self.channel.send(&self.config.endpoint, &cmd).await?;
        let response: CreateDeviceResponse = serde_json::from_str(output.trim())?;

        self.connected.lock().insert(volume.nqn.clone());
        Ok(response.handle)
    }

    async fn detach(
        &self,
        _service_address: &ServiceAddress,
        device_id: &str,
    ) -> Result<DetachOutcome> {
        let mut cmd = self.sma("delete-device");
        cmd.extend(argv(["--handle", device_id]));

        match self.channel.send(&self.config.endpoint, &cmd).await {
            Ok(_) => Ok(DetachOutcome::Detached),
            Err(Error::Command { ref stderr, .. }) if is_absent_message(stderr) => {
                Ok(DetachOutcome::AlreadyAbsent)
            }
            Err(e) => Err(e),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let nqns: Vec<String> = std::mem::take(&mut *self.connected.lock())
            .into_iter()
            .collect();

        for nqn in nqns {
            let cmd = argv(["nvme", "disconnect", "-n", nqn.as_str()]);
            match self.channel.send(&self.config.endpoint, &cmd).await {
                Ok(_) => debug!("Disconnected initiator from {}", nqn),
                Err(Error::Command { .. }) => debug!("Initiator for {} already gone", nqn),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::scripted::ScriptedChannel;
    use crate::domain::ports::HostTargetPlatform;
    use crate::platform::simulated::SimulatedTestbed;
    use assert_matches::assert_matches;

    fn volumes(testbed: &SimulatedTestbed, n: usize) -> Vec<VolumeRef> {
        testbed.seed_volumes("nqn.2016-06.io.spdk:cnode0", n)
    }

    #[tokio::test]
    async fn test_attach_within_ceiling() {
        let testbed = SimulatedTestbed::new(8);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);

        let handles = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 2))
            .await
            .unwrap();

        assert_eq!(handles.len(), 2);
        assert_eq!(handles[0].index, 0);
        assert_eq!(handles[1].index, 1);
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 2);
        assert_eq!(ipu.attached_count(), 2);
        assert_eq!(testbed.max_concurrent_attaches(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_is_inclusive() {
        let testbed = SimulatedTestbed::new(8);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);

        let handles = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 8))
            .await
            .unwrap();
        assert_eq!(handles.len(), 8);
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_above_ceiling_fails_and_rolls_back() {
        // hardware would accept more; the ceiling must still trip
        let testbed = SimulatedTestbed::new(16);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);

        let result = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 9))
            .await;

        assert_matches!(
            result,
            Err(Error::CapacityExceeded { requested: 9, ceiling: 8 })
        );
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 0);
        assert_eq!(ipu.attached_count(), 0);
        assert_eq!(testbed.attach_calls(), 8);
    }

    #[tokio::test]
    async fn test_transport_failure_rolls_back() {
        // hardware limit below the ceiling makes the third attach fail
        let testbed = SimulatedTestbed::new(2);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);

        let result = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 3))
            .await;

        assert_matches!(result, Err(Error::Command { .. }));
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_delete_is_idempotent() {
        let testbed = SimulatedTestbed::new(8);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);
        let handles = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 3))
            .await
            .unwrap();

        let first = ipu.delete_virtio_blk_devices(&handles).await.unwrap();
        assert_eq!(first, vec![true, true, true]);
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 0);

        let second = ipu.delete_virtio_blk_devices(&handles).await.unwrap();
        assert_eq!(second, vec![true, true, true]);
    }

    #[tokio::test]
    async fn test_stale_handle_delete_keeps_reattached_device() {
        let testbed = SimulatedTestbed::new(8);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);
        let volume = volumes(&testbed, 1);
        let address = host.get_service_address();

        let first = ipu
            .create_virtio_blk_devices_sequentially(&address, &volume)
            .await
            .unwrap();
        assert_eq!(ipu.delete_virtio_blk_devices(&first).await.unwrap(), vec![true]);

        let second = ipu
            .create_virtio_blk_devices_sequentially(&address, &volume)
            .await
            .unwrap();
        assert_ne!(first[0].id, second[0].id);

        // the old handle is already gone; the new device must stay tracked
        assert_eq!(ipu.delete_virtio_blk_devices(&first).await.unwrap(), vec![true]);
        assert_eq!(ipu.attached_count(), 1);
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 1);

        ipu.clean().await.unwrap();
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clean_detaches_leftovers() {
        let testbed = SimulatedTestbed::new(8);
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);
        ipu.create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 4))
            .await
            .unwrap();

        ipu.clean().await.unwrap();
        assert_eq!(host.get_number_of_virtio_blk_devices().await.unwrap(), 0);
        assert_eq!(ipu.attached_count(), 0);

        // nothing left to clean
        ipu.clean().await.unwrap();
    }

    #[tokio::test]
    async fn test_workload_through_handle() {
        let testbed = SimulatedTestbed::new(8);
        testbed.fail_pattern("randwrite");
        let host = testbed.host();
        let ipu = IpuStoragePlatform::new(testbed.remoting_backend(), 8);
        let handles = ipu
            .create_virtio_blk_devices_sequentially(&host.get_service_address(), &volumes(&testbed, 1))
            .await
            .unwrap();

        let base = WorkloadConfig::default();
        assert!(handles[0].run_workload(&base.with_pattern("READ")).await.unwrap());
        assert!(!handles[0].run_workload(&base.with_pattern("RANDWRITE")).await.unwrap());
    }

    // -------------------------------------------------------------------------
    // SMA backend
    // -------------------------------------------------------------------------

    fn volume() -> VolumeRef {
        VolumeRef {
            index: 0,
            bdev_name: "Malloc0".into(),
            nsid: 1,
            nqn: "nqn.2016-06.io.spdk:cnode0".into(),
            target_address: "10.0.0.1".into(),
            nvme_port: 4420,
        }
    }

    fn address() -> ServiceAddress {
        ServiceAddress {
            host: "10.0.0.3".into(),
            port: 50051,
        }
    }

    #[tokio::test]
    async fn test_sma_attach_parses_handle() {
        let channel = Arc::new(ScriptedChannel::new());
        channel.on("ipu", "create-device", r#"{"handle": "virtio_blk:sma-0"}"#);
        let backend = SmaRemotingBackend::new(channel.clone(), IpuConfig::default());

        let id = backend.attach(&address(), &volume()).await.unwrap();
        assert_eq!(id, "virtio_blk:sma-0");

        let calls = channel.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("ipu: sma-client.py --address 127.0.0.1 --port 8080 create-device"));
        assert!(calls[0].contains(r#""trsvcid":"4420""#));
    }

    #[tokio::test]
    async fn test_sma_detach_outcomes() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .fail("ipu", "--handle gone", 1, "Device not found")
            .fail("ipu", "--handle broken", 1, "connection reset")
            .on("ipu", "delete-device", "");
        let backend = SmaRemotingBackend::new(channel, IpuConfig::default());

        assert_eq!(
            backend.detach(&address(), "ok").await.unwrap(),
            DetachOutcome::Detached
        );
        assert_eq!(
            backend.detach(&address(), "gone").await.unwrap(),
            DetachOutcome::AlreadyAbsent
        );
        assert_matches!(
            backend.detach(&address(), "broken").await,
            Err(Error::Command { .. })
        );
    }

    #[tokio::test]
    async fn test_sma_fio_result() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .on("ipu", "--handle good", r#"{"jobs": [{"jobname": "a", "error": 0}]}"#)
            .on("ipu", "--handle bad", r#"{"jobs": [{"jobname": "a", "error": 5}]}"#)
            .on("ipu", "--handle junk", "fio: command not found");
        let backend = SmaRemotingBackend::new(channel.clone(), IpuConfig::default());
        let cfg = WorkloadConfig::default().with_pattern("randrw");

        assert!(backend.run_workload("good", &cfg).await.unwrap());
        assert!(!backend.run_workload("bad", &cfg).await.unwrap());
        assert!(!backend.run_workload("junk", &cfg).await.unwrap());
        assert!(channel.calls()[0].contains(r#"{"rw":"randrw"}"#));
    }

    #[tokio::test]
    async fn test_sma_disconnect_is_idempotent() {
        let channel = Arc::new(ScriptedChannel::new());
        channel
            .on("ipu", "create-device", r#"{"handle": "h0"}"#)
            .fail("ipu", "nvme disconnect", 1, "no subsystem");
        let backend = SmaRemotingBackend::new(channel.clone(), IpuConfig::default());

        backend.attach(&address(), &volume()).await.unwrap();
        backend.disconnect().await.unwrap();
        backend.disconnect().await.unwrap();
        assert_eq!(channel.count_matching("nvme disconnect"), 1);
    }
}
