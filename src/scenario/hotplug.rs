//! Hot-plug Scenarios
//!
//! Drive the storage target, the IPU and the host through:
//! - baseline: attach the minimum batch, exercise I/O, delete twice
//! - at-capacity: attach exactly the ceiling, delete twice
//! - above-capacity: attach one past the ceiling and expect refusal

use super::{collect_teardown, ensure, ScenarioReport, StepLog};
use crate::config::HarnessConfig;
use crate::domain::ports::{DeviceHandle, VolumeRef};
use crate::error::{Error, Result};
use crate::platform::PlatformSet;
use crate::poll::{poll_until_eq, PollPolicy};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The hot-plug scenarios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum HotPlugScenario {
    Baseline,
    AtCapacity,
    AboveCapacity,
}

impl HotPlugScenario {
    pub const ALL: [HotPlugScenario; 3] = [
        HotPlugScenario::Baseline,
        HotPlugScenario::AtCapacity,
        HotPlugScenario::AboveCapacity,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HotPlugScenario::Baseline => "baseline",
            HotPlugScenario::AtCapacity => "at-capacity",
            HotPlugScenario::AboveCapacity => "above-capacity",
        }
    }
}

impl std::fmt::Display for HotPlugScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Runs hot-plug scenarios against one set of platforms
pub struct HotPlugRunner {
    config: HarnessConfig,
    platforms: PlatformSet,
    settle: PollPolicy,
}

impl HotPlugRunner {
    pub fn new(config: HarnessConfig, platforms: PlatformSet) -> Self {
        let settle = config.poll.policy();
        Self {
            config,
            platforms,
            settle,
        }
    }

    /// Run one scenario, tearing down afterwards whatever the outcome
    pub async fn run(&self, scenario: HotPlugScenario) -> ScenarioReport {
        info!(
            "Running {} scenario in {} environment",
            scenario, self.platforms.environment
        );
        let mut steps = StepLog::new(scenario.name());

        let outcome = match scenario {
            HotPlugScenario::Baseline => self.baseline(&mut steps).await,
            HotPlugScenario::AtCapacity => self.at_capacity(&mut steps).await,
            HotPlugScenario::AboveCapacity => self.above_capacity(&mut steps).await,
        };

        let teardown_errors = self.teardown().await;
        steps.finish(self.platforms.environment, outcome, teardown_errors)
    }

    /// Run several scenarios in order, each with its own teardown
    pub async fn run_all(&self, scenarios: &[HotPlugScenario]) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            reports.push(self.run(*scenario).await);
        }
        reports
    }

    // =========================================================================
    // Scenario bodies
    // =========================================================================

    async fn baseline(&self, steps: &mut StepLog) -> Result<()> {
        let count = self.config.min_ramdrive;
        let volumes = self.prepare(steps, count).await?;
        let devices = self.attach(steps, &volumes).await?;
        self.expect_host_count(steps, count).await?;
        self.exercise(steps, &devices).await?;
        self.delete_twice(steps, &devices).await
    }

    async fn at_capacity(&self, steps: &mut StepLog) -> Result<()> {
        let count = self.config.max_ramdrive;
        let volumes = self.prepare(steps, count).await?;
        let devices = self.attach(steps, &volumes).await?;
        self.expect_host_count(steps, count).await?;
        self.delete_twice(steps, &devices).await
    }

    async fn above_capacity(&self, steps: &mut StepLog) -> Result<()> {
        let ceiling = self.platforms.remoting.capacity_ceiling();
        let count = self.config.max_ramdrive + 1;
        let volumes = self.prepare(steps, count).await?;
        ensure(
            volumes.len() > ceiling,
            "volume count exceeds capacity ceiling",
            format!("more than {}", ceiling),
            volumes.len(),
        )?;

        let address = self.platforms.host.get_service_address();
        match self
            .platforms
            .remoting
            .create_virtio_blk_devices_sequentially(&address, &volumes)
            .await
        {
            Err(Error::CapacityExceeded { requested, ceiling }) => {
                steps.record(format!(
                    "attach of {} volumes refused at ceiling {}",
                    requested, ceiling
                ));
            }
            Err(e) => return Err(e),
            Ok(devices) => {
                warn!(
                    "{} devices attached past the ceiling, deleting them",
                    devices.len()
                );
                self.platforms
                    .remoting
                    .delete_virtio_blk_devices(&devices)
                    .await?;
                return Err(Error::consistency(
                    "attach above capacity is refused",
                    "CapacityExceeded",
                    format!("{} devices attached", devices.len()),
                ));
            }
        }

        self.expect_host_count(steps, 0).await
    }

    // =========================================================================
    // Steps
    // =========================================================================

    /// Bring up the target and export `count` volumes; the host sees none yet
    async fn prepare(&self, steps: &mut StepLog, count: usize) -> Result<Vec<VolumeRef>> {
        let storage = &self.platforms.storage;
        let port = self.config.nvme_port;

        ensure(
            storage.is_port_free(port).await?,
            "NVMe port free before subsystem creation",
            "free",
            "occupied",
        )?;
        steps.record(format!("port {} free", port));

        let subsystem = storage
            .create_subsystem(&self.config.nqn, port, self.config.management_port)
            .await?;
        steps.record(format!(
            "subsystem {} created at {}:{}",
            subsystem.nqn, subsystem.target_address, subsystem.nvme_port
        ));

        ensure(
            !storage.is_port_free(port).await?,
            "NVMe port occupied after subsystem creation",
            "occupied",
            "free",
        )?;
        let process = &self.config.storage.process_name;
        ensure(
            storage.is_app_listening_on_port(process, port).await?,
            "storage target listening on NVMe port",
            process,
            "another process",
        )?;
        steps.record(format!("{} listening on port {}", process, port));

        let volumes = storage
            .create_ramdrives(
                count,
                port,
                &self.config.nqn,
                self.config.management_port,
            )
            .await?;
        ensure(
            volumes.len() == count,
            "ramdrive count",
            count,
            volumes.len(),
        )?;
        steps.record(format!("{} ramdrives created", count));

        self.expect_host_count(steps, 0).await?;
        Ok(volumes)
    }

    async fn attach(&self, steps: &mut StepLog, volumes: &[VolumeRef]) -> Result<Vec<DeviceHandle>> {
        let address = self.platforms.host.get_service_address();
        let devices = self
            .platforms
            .remoting
            .create_virtio_blk_devices_sequentially(&address, volumes)
            .await?;
        steps.record(format!("{} devices attached to {}", devices.len(), address));
        Ok(devices)
    }

    /// Poll the host until it sees exactly `expected` devices
    async fn expect_host_count(&self, steps: &mut StepLog, expected: usize) -> Result<()> {
        let host = self.platforms.host.clone();
        let condition = format!("host sees {} virtio-blk devices", expected);
        poll_until_eq(&self.settle, &condition, expected, move || {
            let host = host.clone();
            async move { host.get_number_of_virtio_blk_devices().await }
        })
        .await?;
        steps.record(condition);
        Ok(())
    }

    /// Every configured access pattern against every device
    async fn exercise(&self, steps: &mut StepLog, devices: &[DeviceHandle]) -> Result<()> {
        for workload in self.config.workload.workloads() {
            let pattern = workload.pattern().unwrap_or("default").to_string();
            for device in devices {
                let passed = device.run_workload(&workload).await?;
                ensure(
                    passed,
                    &format!("{} workload on {}", pattern, device.id),
                    "success",
                    "failure",
                )?;
            }
            steps.record(format!("{} passed on {} devices", pattern, devices.len()));
        }
        Ok(())
    }

    /// Delete, confirm the host is empty, delete again expecting no-ops
    async fn delete_twice(&self, steps: &mut StepLog, devices: &[DeviceHandle]) -> Result<()> {
        let remoting = &self.platforms.remoting;

        let first = remoting.delete_virtio_blk_devices(devices).await?;
        let deleted = first.iter().filter(|ok| **ok).count();
        ensure(
            deleted == devices.len(),
            "devices deleted",
            devices.len(),
            deleted,
        )?;
        steps.record(format!("{} devices deleted", deleted));

        self.expect_host_count(steps, 0).await?;

        let second = remoting.delete_virtio_blk_devices(devices).await?;
        let idempotent = second.iter().filter(|ok| **ok).count();
        ensure(
            idempotent == devices.len(),
            "second delete reports success",
            devices.len(),
            idempotent,
        )?;
        steps.record("second delete is a no-op");
        Ok(())
    }

    /// Clean remoting, storage and host in that order
    async fn teardown(&self) -> Vec<String> {
        let mut errors = Vec::new();
        collect_teardown(&mut errors, "remoting", self.platforms.remoting.clean().await);
        collect_teardown(&mut errors, "storage", self.platforms.storage.clean().await);
        collect_teardown(&mut errors, "host", self.platforms.host.clean().await);
        errors
    }
}
