// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Volume Hot-Plug Engine (C5): three-phase attach and detach against the
//! external block layer and the hypervisor monitor, device-name
//! allocation, and guest-device discovery via monitor query (§4.4).

use crate::monitor::{BlockDeviceEntry, HypervisorMonitor};
use crate::state_store::StateStore;
use common::bus::Bus;
use common::error::DaemonError;
use common::requests::{EbsMountReply, EbsRequest, EbsSyncReply, EbsUnmountReply};
use common::types::{BlockDeviceMapping, InstanceState, VmRecord, VolumeRequest};
use std::sync::Arc;
use std::time::Duration;

const GUEST_DEVICE_RETRY_ATTEMPTS: u32 = 5;
const GUEST_DEVICE_RETRY_INTERVAL: Duration = Duration::from_millis(200);

pub struct VolumeEngine {
    bus: Arc<dyn Bus>,
    node_id: String,
    request_timeout: Duration,
    /// Pause between guest `device_del` and the NBD-node teardown in detach,
    /// ~100ms in production, 0 in tests (§4.4.2, §9).
    pub detach_pause: Duration,
}

impl VolumeEngine {
    pub fn new(bus: Arc<dyn Bus>, node_id: String, request_timeout: Duration, detach_pause: Duration) -> Self {
        Self {
            bus,
            node_id,
            request_timeout,
            detach_pause,
        }
    }

    fn iothread_id(volume_id: &str) -> String {
        format!("ioth-{volume_id}")
    }

    fn block_node_name(volume_id: &str) -> String {
        format!("nbd-{volume_id}")
    }

    fn guest_device_id(volume_id: &str) -> String {
        format!("vdisk-{volume_id}")
    }

    /// `/dev/sdf`→`hotplug1`, `/dev/sdg`→`hotplug2`, … (§4.4.1).
    fn hotplug_root_port(device_name: &str) -> Result<String, DaemonError> {
        let letter = device_name
            .strip_prefix("/dev/sd")
            .and_then(|s| s.chars().next())
            .ok_or_else(|| DaemonError::InvalidParameterValue(format!("not a guest slot: {device_name}")))?;
        let index = (letter as u32).wrapping_sub('f' as u32) + 1;
        Ok(format!("hotplug{index}"))
    }

    /// Phase-1 network mount, reused directly by the Instance Supervisor
    /// when preparing a VM's initial disks before the hypervisor exists.
    pub(crate) async fn mount(&self, volume_id: &str, device_name: &str) -> Result<String, DaemonError> {
        let subject = format!("ebs.{}.mount", self.node_id);
        let payload = serde_json::to_vec(&EbsRequest {
            name: volume_id.to_string(),
            device_name: device_name.to_string(),
        })
        .map_err(|e| DaemonError::ServerInternal(format!("encode ebs mount request: {e}")))?;
        let response = self
            .bus
            .request(&subject, payload, self.request_timeout)
            .await
            .map_err(|e| DaemonError::ServerInternal(format!("ebs mount request: {e}")))?;
        let reply: EbsMountReply = serde_json::from_slice(&response)
            .map_err(|e| DaemonError::ServerInternal(format!("decode ebs mount reply: {e}")))?;
        if !reply.mounted {
            return Err(DaemonError::ServerInternal(
                reply.error.unwrap_or_else(|| "mount failed".to_string()),
            ));
        }
        reply
            .uri
            .ok_or_else(|| DaemonError::ServerInternal("mount succeeded without a URI".to_string()))
    }

    /// Attach precondition (§4.4.1): the volume must exist and be
    /// `available` (not already attached elsewhere). Queries the block
    /// layer rather than trusting local state, since attachment elsewhere
    /// is only known to it.
    async fn check_available(&self, volume_id: &str) -> Result<(), DaemonError> {
        let subject = format!("ebs.{}.sync", self.node_id);
        let payload = serde_json::to_vec(&EbsRequest {
            name: volume_id.to_string(),
            device_name: String::new(),
        })
        .map_err(|e| DaemonError::ServerInternal(format!("encode ebs sync request: {e}")))?;
        let response = self
            .bus
            .request(&subject, payload, self.request_timeout)
            .await
            .map_err(|e| DaemonError::ServerInternal(format!("ebs sync request: {e}")))?;
        let reply: EbsSyncReply = serde_json::from_slice(&response)
            .map_err(|e| DaemonError::ServerInternal(format!("decode ebs sync reply: {e}")))?;
        if !reply.exists {
            return Err(DaemonError::InvalidVolumeNotFound(volume_id.to_string()));
        }
        if reply.in_use {
            return Err(DaemonError::VolumeInUse(volume_id.to_string()));
        }
        Ok(())
    }

    /// Best-effort; failures are logged, never propagated (§4.4.2 Phase 3).
    pub(crate) async fn unmount(&self, volume_id: &str) {
        let subject = format!("ebs.{}.unmount", self.node_id);
        let payload = match serde_json::to_vec(&EbsRequest {
            name: volume_id.to_string(),
            device_name: String::new(),
        }) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(volume_id, error = %e, "failed to encode unmount request");
                return;
            }
        };
        match self.bus.request(&subject, payload, self.request_timeout).await {
            Ok(response) => match serde_json::from_slice::<EbsUnmountReply>(&response) {
                Ok(reply) if !reply.success => {
                    tracing::warn!(volume_id, error = ?reply.error, "unmount reported failure");
                }
                Err(e) => tracing::warn!(volume_id, error = %e, "failed to decode unmount reply"),
                _ => {}
            },
            Err(e) => tracing::warn!(volume_id, error = %e, "unmount request failed"),
        }
    }

    /// Deletes `volume_id` from the block layer after it has been unmounted,
    /// for `deleteOnTermination` volumes and always-regenerated internal
    /// volumes (§4.3 Terminate, §6.1 `ebs.delete`). Best-effort.
    pub(crate) async fn delete(&self, volume_id: &str) {
        let payload = match serde_json::to_vec(&EbsRequest {
            name: volume_id.to_string(),
            device_name: String::new(),
        }) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(volume_id, error = %e, "failed to encode ebs.delete request");
                return;
            }
        };
        if let Err(e) = self.bus.request("ebs.delete", payload, self.request_timeout).await {
            tracing::warn!(volume_id, error = %e, "ebs.delete request failed");
        }
    }

    /// Attaches `volume_id` to `vm` via the three-phase protocol (§4.4.1).
    #[allow(clippy::too_many_arguments)]
    pub async fn attach(
        &self,
        vm: &mut VmRecord,
        monitor: &dyn HypervisorMonitor,
        volume_id: &str,
        requested_device: Option<String>,
        volume_zone: Option<&str>,
        node_zone: Option<&str>,
        boot: bool,
        efi: bool,
        cloud_init: bool,
        delete_on_termination: bool,
        store: &StateStore,
    ) -> Result<String, DaemonError> {
        if vm.state != InstanceState::Running {
            return Err(DaemonError::IncorrectInstanceState(format!(
                "instance {} is not Running",
                vm.instance_id
            )));
        }
        self.check_available(volume_id).await?;
        if let (Some(vz), Some(nz)) = (volume_zone, node_zone) {
            if vz != nz {
                return Err(DaemonError::InvalidVolumeZoneMismatch(format!(
                    "volume {volume_id} is in {vz}, node is in {nz}"
                )));
            }
        }

        let device_name = match requested_device {
            Some(d) => d,
            None => vm
                .next_available_device()
                .ok_or_else(|| DaemonError::AttachmentLimitExceeded(vm.instance_id.clone()))?,
        };

        // Phase 1: network mount.
        let uri = self.mount(volume_id, &device_name).await?;

        // Phase 2: virtual block node.
        let iothread = Self::iothread_id(volume_id);
        let block_node = Self::block_node_name(volume_id);
        if let Err(e) = monitor.object_add("iothread", &iothread).await {
            self.unmount(volume_id).await;
            return Err(e);
        }
        if let Err(e) = monitor.blockdev_add("nbd", &block_node, &uri).await {
            self.unmount(volume_id).await;
            return Err(e);
        }

        // Phase 3: guest device.
        let device_id = Self::guest_device_id(volume_id);
        let root_port = Self::hotplug_root_port(&device_name)?;
        if let Err(e) = monitor
            .device_add(&device_id, "virtio-blk-pci", &block_node, &root_port)
            .await
        {
            match monitor.blockdev_del(&block_node).await {
                Ok(()) => self.unmount(volume_id).await,
                Err(teardown_err) => {
                    tracing::error!(
                        volume_id,
                        error = %teardown_err,
                        "blockdev-del failed after device_add failure; leaving NBD node in place to avoid crashing the VM"
                    );
                }
            }
            return Err(e);
        }

        let guest_name = self.discover_guest_device(monitor, &device_id, &device_name).await;

        vm.block_device_mappings.retain(|m| m.volume_id != volume_id);
        vm.block_device_mappings.push(BlockDeviceMapping {
            device_name: guest_name.clone(),
            volume_id: volume_id.to_string(),
            delete_on_termination,
        });
        vm.volumes.retain(|v| v.volume_id != volume_id);
        vm.volumes.push(VolumeRequest {
            volume_id: volume_id.to_string(),
            device_name,
            boot,
            efi,
            cloud_init,
            delete_on_termination,
            uri: Some(uri),
        });
        store.save(vm).await?;
        Ok(guest_name)
    }

    /// Detaches `volume_id` from `vm`, reversing attach phase by phase (§4.4.2).
    pub async fn detach(
        &self,
        vm: &mut VmRecord,
        monitor: &dyn HypervisorMonitor,
        volume_id: &str,
        expected_device: Option<&str>,
        force: bool,
        store: &StateStore,
    ) -> Result<(), DaemonError> {
        if vm.state != InstanceState::Running {
            return Err(DaemonError::IncorrectInstanceState(format!(
                "instance {} is not Running",
                vm.instance_id
            )));
        }
        let volume = vm
            .volumes
            .iter()
            .find(|v| v.volume_id == volume_id)
            .ok_or_else(|| DaemonError::InvalidVolumeNotFound(volume_id.to_string()))?
            .clone();
        if volume.is_internal() {
            return Err(DaemonError::OperationNotPermitted(format!(
                "volume {volume_id} is a boot/EFI/cloud-init volume"
            )));
        }
        if let Some(expected) = expected_device {
            let actual = vm
                .block_device_mappings
                .iter()
                .find(|m| m.volume_id == volume_id)
                .map(|m| m.device_name.as_str());
            if actual != Some(expected) {
                return Err(DaemonError::InvalidParameterValue(format!(
                    "expected device {expected} does not match actual attachment"
                )));
            }
        }

        let device_id = Self::guest_device_id(volume_id);
        let block_node = Self::block_node_name(volume_id);
        let iothread = Self::iothread_id(volume_id);

        // Phase 1: guest device.
        if let Err(e) = monitor.device_del(&device_id).await {
            if !force {
                return Err(DaemonError::ServerInternal(format!("device_del {device_id}: {e}")));
            }
            tracing::warn!(volume_id, error = %e, "device_del failed, continuing because force=true");
        }

        if self.detach_pause > Duration::ZERO {
            tokio::time::sleep(self.detach_pause).await;
        }

        // Phase 2: virtual block node. A failure here must not proceed to
        // unmount or mutate any state (§4.4.2).
        if let Err(e) = monitor.blockdev_del(&block_node).await {
            return Err(DaemonError::ServerInternal(format!("blockdev_del {block_node}: {e}")));
        }

        // Phase 2b: IO thread, best effort.
        if let Err(e) = monitor.object_del(&iothread).await {
            tracing::warn!(volume_id, error = %e, "object_del failed, ignoring");
        }

        // Phase 3: network unmount, best effort.
        self.unmount(volume_id).await;

        vm.volumes.retain(|v| v.volume_id != volume_id);
        vm.block_device_mappings.retain(|m| m.volume_id != volume_id);
        store.save(vm).await?;
        Ok(())
    }

    /// Resolves the guest-visible `/dev/vdX` name for `expected_id`, retrying
    /// while the device settles after a hot-plug, falling back to the
    /// request-supplied slot with a logged warning (§4.4.3).
    async fn discover_guest_device(
        &self,
        monitor: &dyn HypervisorMonitor,
        expected_id: &str,
        fallback_slot: &str,
    ) -> String {
        for attempt in 0..GUEST_DEVICE_RETRY_ATTEMPTS {
            match monitor.query_block().await {
                Ok(entries) => {
                    let map = assign_guest_device_names(entries);
                    if let Some(name) = map.get(expected_id) {
                        return name.clone();
                    }
                }
                Err(e) => tracing::warn!(expected_id, attempt, error = %e, "query_block failed"),
            }
            tokio::time::sleep(GUEST_DEVICE_RETRY_INTERVAL).await;
        }
        tracing::warn!(expected_id, fallback_slot, "guest device not observed, falling back to requested slot");
        fallback_slot.to_string()
    }
}

/// PCI enumeration order key: boot-time `device[N]` sorts before hot-plugged
/// `hotplugM`, which gets a high offset so it always sorts after boot
/// devices (§4.4.3).
fn pci_sort_key(qdev: &str) -> u32 {
    if let Some(start) = qdev.find("device[") {
        let rest = &qdev[start + "device[".len()..];
        if let Some(end) = rest.find(']') {
            if let Ok(n) = rest[..end].parse::<u32>() {
                return n;
            }
        }
    }
    if let Some(pos) = qdev.find("hotplug") {
        let rest = &qdev[pos + "hotplug".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(m) = digits.parse::<u32>() {
            return 10_000 + m;
        }
    }
    u32::MAX
}

const MAX_GUEST_DEVICES: usize = 26;

fn assign_guest_device_names(mut entries: Vec<BlockDeviceEntry>) -> std::collections::HashMap<String, String> {
    entries.sort_by_key(|e| pci_sort_key(&e.qdev));
    if entries.len() > MAX_GUEST_DEVICES {
        tracing::warn!(count = entries.len(), cap = MAX_GUEST_DEVICES, "more block devices than guest letters, truncating");
        entries.truncate(MAX_GUEST_DEVICES);
    }
    entries
        .into_iter()
        .enumerate()
        .map(|(i, entry)| {
            let letter = (b'a' + i as u8) as char;
            (entry.device, format!("/dev/vd{letter}"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::FakeMonitor;
    use common::bus::InMemoryBus;
    use common::persistence::InMemoryStorage;
    use common::types::HealthCounters;

    fn sample_vm() -> VmRecord {
        VmRecord {
            instance_id: "i-1".into(),
            instance_type: "t3.micro".into(),
            state: InstanceState::Running,
            image_id: "ami-1".into(),
            reservation_id: "r-1".into(),
            owner_id: "acct-1".into(),
            launch_time: chrono::Utc::now(),
            key_name: None,
            subnet_id: None,
            block_device_mappings: Vec::new(),
            volumes: Vec::new(),
            pid: Some(1),
            monitor_socket: None,
            health: HealthCounters::default(),
            last_node: "node-a".into(),
            stop_requested: false,
        }
    }

    fn engine() -> VolumeEngine {
        VolumeEngine::new(
            Arc::new(InMemoryBus::new()),
            "node-a".into(),
            Duration::from_secs(1),
            Duration::ZERO,
        )
    }

    async fn responder(bus: Arc<InMemoryBus>, subject: &'static str, reply: Vec<u8>) {
        let mut sub = bus.subscribe(subject, None).await.unwrap();
        tokio::spawn(async move {
            if let Some(msg) = sub.next().await {
                common::bus::reply(&*bus, &msg, reply).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn hotplug_root_port_maps_sdf_to_hotplug1() {
        assert_eq!(VolumeEngine::hotplug_root_port("/dev/sdf").unwrap(), "hotplug1");
        assert_eq!(VolumeEngine::hotplug_root_port("/dev/sdg").unwrap(), "hotplug2");
    }

    #[tokio::test]
    async fn attach_rejects_when_instance_not_running() {
        let engine = engine();
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        let mut vm = sample_vm();
        vm.state = InstanceState::Stopped;
        let err = engine
            .attach(&mut vm, &monitor, "vol-1", None, None, None, false, false, false, true, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "IncorrectInstanceState");
    }

    #[tokio::test]
    async fn attach_zone_mismatch_rejected_before_any_mutation() {
        let bus = Arc::new(InMemoryBus::new());
        responder(
            bus.clone(),
            "ebs.node-a.sync",
            serde_json::to_vec(&EbsSyncReply {
                exists: true,
                in_use: false,
                error: None,
            })
            .unwrap(),
        )
        .await;
        let engine = VolumeEngine::new(bus, "node-a".into(), Duration::from_secs(1), Duration::ZERO);
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        let mut vm = sample_vm();
        let err = engine
            .attach(
                &mut vm, &monitor, "vol-1", None, Some("us-east-1b"), Some("us-east-1a"), false, false, false, true, &store,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidVolume.ZoneMismatch");
        assert!(vm.volumes.is_empty());
    }

    #[tokio::test]
    async fn attach_rejects_missing_volume() {
        let bus = Arc::new(InMemoryBus::new());
        responder(
            bus.clone(),
            "ebs.node-a.sync",
            serde_json::to_vec(&EbsSyncReply {
                exists: false,
                in_use: false,
                error: Some("no such volume".into()),
            })
            .unwrap(),
        )
        .await;
        let engine = VolumeEngine::new(bus, "node-a".into(), Duration::from_secs(1), Duration::ZERO);
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        let mut vm = sample_vm();
        let err = engine
            .attach(&mut vm, &monitor, "vol-missing", None, None, None, false, false, false, true, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "InvalidVolume.NotFound");
    }

    #[tokio::test]
    async fn attach_rejects_volume_already_in_use() {
        let bus = Arc::new(InMemoryBus::new());
        responder(
            bus.clone(),
            "ebs.node-a.sync",
            serde_json::to_vec(&EbsSyncReply {
                exists: true,
                in_use: true,
                error: None,
            })
            .unwrap(),
        )
        .await;
        let engine = VolumeEngine::new(bus, "node-a".into(), Duration::from_secs(1), Duration::ZERO);
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        let mut vm = sample_vm();
        let err = engine
            .attach(&mut vm, &monitor, "vol-1", None, None, None, false, false, false, true, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VolumeInUse");
    }

    #[tokio::test]
    async fn full_attach_succeeds_and_resolves_guest_device() {
        let bus = Arc::new(InMemoryBus::new());
        responder(
            bus.clone(),
            "ebs.node-a.sync",
            serde_json::to_vec(&EbsSyncReply {
                exists: true,
                in_use: false,
                error: None,
            })
            .unwrap(),
        )
        .await;
        responder(
            bus.clone(),
            "ebs.node-a.mount",
            serde_json::to_vec(&EbsMountReply {
                uri: Some("nbd://127.0.0.1:10001".into()),
                mounted: true,
                error: None,
            })
            .unwrap(),
        )
        .await;

        let engine = VolumeEngine::new(bus, "node-a".into(), Duration::from_secs(1), Duration::ZERO);
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        *monitor.block_devices.lock().await = vec![BlockDeviceEntry {
            device: "vdisk-vol-1".into(),
            qdev: "/machine/peripheral/vdisk-vol-1/virtio-backend/hotplug1/virtio-backend".into(),
        }];

        let mut vm = sample_vm();
        let guest_name = engine
            .attach(&mut vm, &monitor, "vol-1", None, None, None, false, false, false, true, &store)
            .await
            .unwrap();
        assert_eq!(guest_name, "/dev/vda");
        assert_eq!(vm.volumes.len(), 1);
        assert_eq!(vm.block_device_mappings[0].device_name, "/dev/vda");
    }

    #[tokio::test]
    async fn detach_rejects_internal_volume() {
        let engine = engine();
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        let mut vm = sample_vm();
        vm.volumes.push(VolumeRequest {
            volume_id: "vol-efi".into(),
            device_name: "/dev/sdf".into(),
            boot: false,
            efi: true,
            cloud_init: false,
            delete_on_termination: true,
            uri: Some("nbd://x".into()),
        });
        let err = engine
            .detach(&mut vm, &monitor, "vol-efi", None, false, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OperationNotPermitted");
    }

    #[tokio::test]
    async fn detach_blockdev_del_failure_leaves_state_intact() {
        let engine = engine();
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let monitor = FakeMonitor::new();
        monitor.set_failure("blockdev_del:nbd-vol-1", "busy").await;
        let mut vm = sample_vm();
        vm.volumes.push(VolumeRequest {
            volume_id: "vol-1".into(),
            device_name: "/dev/sdf".into(),
            boot: false,
            efi: false,
            cloud_init: false,
            delete_on_termination: true,
            uri: Some("nbd://x".into()),
        });
        vm.block_device_mappings.push(BlockDeviceMapping {
            device_name: "/dev/vda".into(),
            volume_id: "vol-1".into(),
            delete_on_termination: true,
        });
        let err = engine
            .detach(&mut vm, &monitor, "vol-1", None, false, &store)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ServerInternal");
        assert_eq!(vm.volumes.len(), 1, "volume must remain attached after failed blockdev_del");
    }

    #[test]
    fn pci_sort_key_orders_boot_before_hotplug() {
        let boot = pci_sort_key("/machine/peripheral-anon/device[2]/virtio-backend");
        let hot = pci_sort_key("/machine/peripheral/vdisk-1/hotplug1/virtio-backend");
        assert!(boot < hot);
    }
}
