// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire and persisted data model shared by every node-daemon component:
//! instance types, VM records, reservations, and cluster configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Internal lifecycle state of a VM record (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Provisioning,
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Error,
}

impl InstanceState {
    /// Whether this state may rest indefinitely.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            InstanceState::Running
                | InstanceState::Stopped
                | InstanceState::Terminated
                | InstanceState::Error
        )
    }

    /// Whether this state must resolve to a stable state in bounded time.
    pub fn is_transitional(self) -> bool {
        !self.is_stable()
    }

    /// The public EC2 `(code, name)` pair for this internal state.
    pub fn public_state(self) -> (u16, &'static str) {
        match self {
            InstanceState::Provisioning | InstanceState::Pending => (0, "pending"),
            InstanceState::Running => (16, "running"),
            InstanceState::Stopping => (64, "stopping"),
            InstanceState::Stopped => (80, "stopped"),
            InstanceState::ShuttingDown => (32, "shutting-down"),
            InstanceState::Terminated => (48, "terminated"),
            InstanceState::Error => (0, "error"),
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Broad class of instance family, driving the sizing rules in §6.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FamilyClass {
    Burstable,
    Compute,
    Balanced,
    Memory,
}

/// A single generated instance type `(name, vCPUs, memoryMiB, architecture, ...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    pub architecture: String,
    pub current_generation: bool,
    pub burstable: bool,
}

impl InstanceType {
    pub fn memory_gib(&self) -> f64 {
        self.memory_mib as f64 / 1024.0
    }
}

/// A disk attached (or soon to be attached) to a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRequest {
    pub volume_id: String,
    pub device_name: String,
    pub boot: bool,
    pub efi: bool,
    pub cloud_init: bool,
    pub delete_on_termination: bool,
    /// Block-device URI once mounted through the block layer; transient,
    /// regenerated on every mount.
    pub uri: Option<String>,
}

impl VolumeRequest {
    pub fn is_internal(&self) -> bool {
        self.efi || self.cloud_init
    }
}

/// An entry in the EC2-shaped block device mapping, keyed by guest device name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub device_name: String,
    pub volume_id: String,
    pub delete_on_termination: bool,
}

/// Crash/restart bookkeeping for the Instance Supervisor's restart policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCounters {
    pub crash_count: u32,
    pub restart_count: u32,
    pub first_crash_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_crash_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_crash_reason: Option<String>,
}

/// The authoritative per-instance value (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub instance_id: String,
    pub instance_type: String,
    pub state: InstanceState,
    pub image_id: String,
    pub reservation_id: String,
    pub owner_id: String,
    pub launch_time: chrono::DateTime<chrono::Utc>,
    pub key_name: Option<String>,
    pub subnet_id: Option<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub volumes: Vec<VolumeRequest>,
    pub pid: Option<u32>,
    pub monitor_socket: Option<String>,
    pub health: HealthCounters,
    pub last_node: String,
    pub stop_requested: bool,
}

impl VmRecord {
    pub fn public_state_code(&self) -> (u16, &'static str) {
        self.state.public_state()
    }

    /// Lowest unused device slot among `/dev/sdf`..`/dev/sdp`, or `None` if
    /// all eleven slots are taken (§4.4 `AttachmentLimitExceeded`).
    pub fn next_available_device(&self) -> Option<String> {
        let used: std::collections::HashSet<&str> = self
            .block_device_mappings
            .iter()
            .map(|m| m.device_name.as_str())
            .chain(self.volumes.iter().map(|v| v.device_name.as_str()))
            .collect();
        (b'f'..=b'p')
            .map(|c| format!("/dev/sd{}", c as char))
            .find(|slot| !used.contains(slot.as_str()))
    }
}

/// A single `RunInstances` call fans out to one reservation with 1..N instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub owner_id: String,
    pub instances: Vec<VmRecord>,
}

/// Per-node configuration entry inside the cluster config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub bus_url: String,
    pub availability_zone: Option<String>,
    pub total_vcpus: u32,
    pub total_memory_gib: f64,
}

/// Cluster-wide configuration, versioned by an epoch counter (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub epoch: u64,
    pub version: String,
    pub node_id: String,
    pub nodes: HashMap<String, NodeConfig>,
}

impl ClusterConfig {
    /// SHA-256 over the canonicalized config with the local `node_id`
    /// field excluded — the handshake used by health checks (§3.1, §4.7).
    pub fn config_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        #[derive(Serialize)]
        struct Canonical<'a> {
            epoch: u64,
            version: &'a str,
            nodes: std::collections::BTreeMap<&'a str, &'a NodeConfig>,
        }
        let nodes = self
            .nodes
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .collect::<std::collections::BTreeMap<_, _>>();
        let canonical = Canonical {
            epoch: self.epoch,
            version: &self.version,
            nodes,
        };
        let bytes = serde_json::to_vec(&canonical).expect("cluster config is always serializable");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_available_device_skips_used_slots() {
        let mut vm = sample_vm();
        vm.volumes.push(VolumeRequest {
            volume_id: "vol-1".into(),
            device_name: "/dev/sdf".into(),
            boot: false,
            efi: false,
            cloud_init: false,
            delete_on_termination: false,
            uri: None,
        });
        assert_eq!(vm.next_available_device().as_deref(), Some("/dev/sdg"));
    }

    #[test]
    fn next_available_device_exhausted_returns_none() {
        let mut vm = sample_vm();
        for c in b'f'..=b'p' {
            vm.volumes.push(VolumeRequest {
                volume_id: format!("vol-{}", c as char),
                device_name: format!("/dev/sd{}", c as char),
                boot: false,
                efi: false,
                cloud_init: false,
                delete_on_termination: false,
                uri: None,
            });
        }
        assert_eq!(vm.next_available_device(), None);
    }

    #[test]
    fn vm_record_json_roundtrip_preserves_fields() {
        let mut vm = sample_vm();
        vm.volumes.push(VolumeRequest {
            volume_id: "vol-1".into(),
            device_name: "/dev/sdf".into(),
            boot: true,
            efi: false,
            cloud_init: false,
            delete_on_termination: true,
            uri: Some("nbd://127.0.0.1:10001".into()),
        });
        let json = serde_json::to_string(&vm).unwrap();
        let back: VmRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_id, vm.instance_id);
        assert_eq!(
            back.volumes[0].delete_on_termination,
            vm.volumes[0].delete_on_termination
        );
        assert_eq!(back.volumes[0].uri, vm.volumes[0].uri);
    }

    fn sample_vm() -> VmRecord {
        VmRecord {
            instance_id: "i-1".into(),
            instance_type: "t3.micro".into(),
            state: InstanceState::Pending,
            image_id: "ami-ok".into(),
            reservation_id: "r-1".into(),
            owner_id: "acct-1".into(),
            launch_time: chrono::Utc::now(),
            key_name: None,
            subnet_id: None,
            block_device_mappings: Vec::new(),
            volumes: Vec::new(),
            pid: None,
            monitor_socket: None,
            health: HealthCounters::default(),
            last_node: "node-a".into(),
            stop_requested: false,
        }
    }
}
