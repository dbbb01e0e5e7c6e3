//! Device Ledger
//!
//! Tracks every remoted block device through
//! `absent -> creating -> attached -> deleting -> absent`, keyed by the
//! backing volume. The number of attached entries is what the host is
//! expected to report.

use crate::domain::ports::{DeviceState, ServiceAddress, VolumeRef};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Ledger key for a volume
pub fn volume_key(volume: &VolumeRef) -> String {
    format!("{}/{}", volume.nqn, volume.bdev_name)
}

#[derive(Debug, Clone)]
struct Entry {
    state: DeviceState,
    device_id: Option<String>,
    service_address: ServiceAddress,
}

/// An attached device as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    pub key: String,
    pub device_id: String,
    pub service_address: ServiceAddress,
}

/// Result of [`DeviceLedger::begin_delete`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteClaim {
    /// The entry moved to `deleting`
    Claimed,
    /// Nothing is tracked for the volume
    Untracked,
    /// The volume is now tracked under a different device; the entry is untouched
    Superseded,
}

/// Per-device state machine
#[derive(Debug, Default)]
pub struct DeviceLedger {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl DeviceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state, `Absent` when untracked
    pub fn state(&self, key: &str) -> DeviceState {
        self.entries
            .read()
            .get(key)
            .map(|e| e.state)
            .unwrap_or(DeviceState::Absent)
    }

    /// absent -> creating
    pub fn begin_create(&self, key: &str, service_address: &ServiceAddress) -> Result<()> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            return Err(invalid(key, entry.state, DeviceState::Creating));
        }
        entries.insert(
            key.to_string(),
            Entry {
                state: DeviceState::Creating,
                device_id: None,
                service_address: service_address.clone(),
            },
        );
        Ok(())
    }

    /// creating -> attached
    pub fn finish_create(&self, key: &str, device_id: &str) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(entry) if entry.state == DeviceState::Creating => {
                entry.state = DeviceState::Attached;
                entry.device_id = Some(device_id.to_string());
                Ok(())
            }
            Some(entry) => Err(invalid(key, entry.state, DeviceState::Attached)),
            None => Err(invalid(key, DeviceState::Absent, DeviceState::Attached)),
        }
    }

    /// creating -> absent, after a failed attach
    pub fn abort_create(&self, key: &str) {
        let mut entries = self.entries.write();
        if matches!(entries.get(key), Some(e) if e.state == DeviceState::Creating) {
            entries.remove(key);
        }
    }

    /// attached -> deleting for `device_id`
    pub fn begin_delete(&self, key: &str, device_id: &str) -> Result<DeleteClaim> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            None => Ok(DeleteClaim::Untracked),
            Some(entry) if entry.device_id.as_deref() != Some(device_id) => {
                Ok(DeleteClaim::Superseded)
            }
            Some(entry) if entry.state == DeviceState::Attached => {
                entry.state = DeviceState::Deleting;
                Ok(DeleteClaim::Claimed)
            }
            Some(entry) => Err(invalid(key, entry.state, DeviceState::Deleting)),
        }
    }

    /// deleting -> absent
    pub fn finish_delete(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// deleting -> attached, after a failed detach
    pub fn restore(&self, key: &str) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            if entry.state == DeviceState::Deleting {
                entry.state = DeviceState::Attached;
            }
        }
    }

    pub fn attached_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|e| e.state == DeviceState::Attached)
            .count()
    }

    /// Snapshot of attached devices in key order
    pub fn attached(&self) -> Vec<AttachedDevice> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.state == DeviceState::Attached)
            .filter_map(|(key, e)| {
                e.device_id.as_ref().map(|id| AttachedDevice {
                    key: key.clone(),
                    device_id: id.clone(),
                    service_address: e.service_address.clone(),
                })
            })
            .collect()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

fn invalid(key: &str, from: DeviceState, to: DeviceState) -> Error {
    Error::InvalidTransition {
        device: key.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn addr() -> ServiceAddress {
        ServiceAddress {
            host: "10.0.0.3".into(),
            port: 50051,
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let ledger = DeviceLedger::new();
        let key = "nqn/Malloc0";

        ledger.begin_create(key, &addr()).unwrap();
        assert_eq!(ledger.state(key), DeviceState::Creating);
        assert_eq!(ledger.attached_count(), 0);

        ledger.finish_create(key, "virtio_blk:0").unwrap();
        assert_eq!(ledger.state(key), DeviceState::Attached);
        assert_eq!(ledger.attached_count(), 1);
        assert_eq!(ledger.attached()[0].device_id, "virtio_blk:0");

        assert_eq!(ledger.begin_delete(key, "virtio_blk:0").unwrap(), DeleteClaim::Claimed);
        assert_eq!(ledger.state(key), DeviceState::Deleting);
        ledger.finish_delete(key);
        assert_eq!(ledger.state(key), DeviceState::Absent);

        // already absent
        assert_eq!(ledger.begin_delete(key, "virtio_blk:0").unwrap(), DeleteClaim::Untracked);
    }

    #[test]
    fn test_recreate_attached_is_rejected() {
        let ledger = DeviceLedger::new();
        ledger.begin_create("k", &addr()).unwrap();
        ledger.finish_create("k", "id").unwrap();

        assert_matches!(
            ledger.begin_create("k", &addr()),
            Err(Error::InvalidTransition { ref from, ref to, .. }) if from == "attached" && to == "creating"
        );
    }

    #[test]
    fn test_stale_device_leaves_newer_entry() {
        let ledger = DeviceLedger::new();
        ledger.begin_create("k", &addr()).unwrap();
        ledger.finish_create("k", "virtio_blk:1").unwrap();
        ledger.begin_delete("k", "virtio_blk:1").unwrap();
        ledger.finish_delete("k");

        ledger.begin_create("k", &addr()).unwrap();
        ledger.finish_create("k", "virtio_blk:2").unwrap();

        assert_eq!(ledger.begin_delete("k", "virtio_blk:1").unwrap(), DeleteClaim::Superseded);
        assert_eq!(ledger.state("k"), DeviceState::Attached);
        assert_eq!(ledger.attached()[0].device_id, "virtio_blk:2");
    }

    #[test]
    fn test_abort_and_restore() {
        let ledger = DeviceLedger::new();
        ledger.begin_create("k", &addr()).unwrap();
        ledger.abort_create("k");
        assert_eq!(ledger.state("k"), DeviceState::Absent);

        ledger.begin_create("k", &addr()).unwrap();
        ledger.finish_create("k", "id").unwrap();
        ledger.begin_delete("k", "id").unwrap();
        ledger.restore("k");
        assert_eq!(ledger.state("k"), DeviceState::Attached);

        ledger.clear();
        assert_eq!(ledger.attached_count(), 0);
    }
}
