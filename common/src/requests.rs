// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Wire request/response shapes for the bus topics this core owns end to end
//! (`ec2.RunInstances.*`, `ec2.cmd.<id>`, `ebs.*`, `hive.*`). Kept here rather
//! than in the dispatcher so a gateway crate can serialize/deserialize
//! against them without depending on the daemon binary (§6.1).

use crate::types::{BlockDeviceMapping, VmRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct RunInstancesRequest {
    /// Attached by the gateway's SigV4-authenticated envelope before the
    /// request reaches the bus; this core trusts it as-is (§1 Out of scope).
    pub owner_id: String,
    pub image_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,
    pub min_count: u32,
    pub max_count: u32,
    pub subnet_id: Option<String>,
    pub user_data: Option<String>,
    #[serde(default)]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationResponse {
    pub reservation_id: String,
    pub owner_id: String,
    pub instances: Vec<VmRecord>,
}

/// Carried on `ec2.StartInstances.<type>` (§3.3): claim a stopped instance
/// of that type out of the shared bucket onto this node.
#[derive(Debug, Clone, Deserialize)]
pub struct StartInstancesRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartInstanceResponse {
    pub instance: VmRecord,
}

/// Per-instance command carried on `ec2.cmd.<instance-id>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "PascalCase")]
pub enum InstanceCommand {
    StopInstance,
    StartInstance,
    TerminateInstance,
    AttachVolume {
        volume_id: String,
        device_name: Option<String>,
        boot: bool,
        efi: bool,
        cloud_init: bool,
        delete_on_termination: bool,
    },
    DetachVolume {
        volume_id: String,
        device_name: Option<String>,
        #[serde(default)]
        force: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachVolumeResponse {
    pub volume_id: String,
    pub device_name: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetachVolumeResponse {
    pub volume_id: String,
    pub instance_id: String,
}

/// Spoken to the external block layer (`ebs.<node>.mount` / `.unmount`).
#[derive(Debug, Clone, Serialize)]
pub struct EbsRequest {
    pub name: String,
    pub device_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EbsMountReply {
    pub uri: Option<String>,
    pub mounted: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EbsUnmountReply {
    pub volume: Option<String>,
    pub success: bool,
    pub error: Option<String>,
}

/// Reply to `ebs.<node>.sync`, the attach-precondition check (§4.4.1):
/// does the volume exist, and is it already attached somewhere else.
#[derive(Debug, Clone, Deserialize)]
pub struct EbsSyncReply {
    pub exists: bool,
    pub in_use: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeDiscoverResponse {
    pub node: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeHealthResponse {
    pub node: String,
    pub status: String,
    pub config_hash: String,
    pub epoch: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceTypeAvailability {
    pub name: String,
    pub available: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStatusResponse {
    pub total_vcpu: u32,
    pub total_mem_gib: f64,
    pub allocated_vcpu: u32,
    pub allocated_mem_gib: f64,
    pub per_type_availability: Vec<InstanceTypeAvailability>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub instance_id: String,
    pub instance_type: String,
    pub state: String,
    pub launch_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeVmsResponse {
    pub vms: Vec<VmSummary>,
}

/// `{"Code": "<ErrorKind>", "Message": "..."}` (§6.2).
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    #[serde(rename = "Code")]
    pub code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl From<&crate::error::DaemonError> for ErrorPayload {
    fn from(e: &crate::error::DaemonError) -> Self {
        ErrorPayload {
            code: e.code().to_string(),
            message: e.message(),
        }
    }
}
