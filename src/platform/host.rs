//! Host Target Platform
//!
//! Counts remoted virtio-blk devices on the consumer host by listing
//! `/sys/block` over the command channel.

use crate::channel::argv;
use crate::domain::ports::{CommandChannelRef, HostTargetPlatform, ServiceAddress};
use crate::error::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Consumer host reached over the command channel
pub struct SysfsHostTarget {
    channel: CommandChannelRef,
    endpoint: String,
    service_address: ServiceAddress,
    device_prefix: String,
}

impl SysfsHostTarget {
    pub fn new(
        channel: CommandChannelRef,
        endpoint: impl Into<String>,
        service_address: ServiceAddress,
        device_prefix: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            endpoint: endpoint.into(),
            service_address,
            device_prefix: device_prefix.into(),
        }
    }

    /// Names under `/sys/block` carrying the device prefix
    pub async fn list_virtio_blk_devices(&self) -> Result<Vec<String>> {
        let output = self
            .channel
            .send(&self.endpoint, &argv(["ls", "-1", "/sys/block"]))
            .await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&self.device_prefix))
            .map(String::from)
            .collect())
    }
}

#[async_trait]
impl HostTargetPlatform for SysfsHostTarget {
    async fn get_number_of_virtio_blk_devices(&self) -> Result<usize> {
        let devices = self.list_virtio_blk_devices().await?;
        debug!("Host {} sees {:?}", self.endpoint, devices);
        Ok(devices.len())
    }

    fn get_service_address(&self) -> ServiceAddress {
        self.service_address.clone()
    }

    async fn clean(&self) -> Result<()> {
        // nothing is reserved on the host; report residue without failing
        match self.list_virtio_blk_devices().await {
            Ok(devices) if !devices.is_empty() => {
                warn!("Host {} still shows devices {:?}", self.endpoint, devices)
            }
            Ok(_) => {}
            Err(e) => warn!("Host {} unreachable during clean: {}", self.endpoint, e),
        }
        Ok(())
    }
}
