// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! State Store (C2): persists VM records in two buckets — per-node for
//! running/transitional instances, cluster-shared for stopped instances
//! keyed by instance id (§2, §6.4).

use common::error::{DaemonError, StorageError};
use common::persistence::Storage;
use common::types::VmRecord;
use std::sync::Arc;

const STOPPED_BUCKET: &str = "state/stopped";

pub struct StateStore {
    storage: Arc<dyn Storage>,
    node_id: String,
}

impl StateStore {
    pub fn new(storage: Arc<dyn Storage>, node_id: String) -> Self {
        Self { storage, node_id }
    }

    fn node_key(&self, instance_id: &str) -> String {
        format!("state/{}/{}", self.node_id, instance_id)
    }

    fn stopped_key(instance_id: &str) -> String {
        format!("{STOPPED_BUCKET}/{instance_id}")
    }

    pub async fn save(&self, vm: &VmRecord) -> Result<(), DaemonError> {
        let json = serde_json::to_string(vm)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.put(&self.node_key(&vm.instance_id), &json).await?;
        Ok(())
    }

    pub async fn load(&self, instance_id: &str) -> Result<Option<VmRecord>, DaemonError> {
        match self.storage.get(&self.node_key(instance_id)).await? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, instance_id: &str) -> Result<(), DaemonError> {
        self.storage.delete(&self.node_key(instance_id)).await?;
        Ok(())
    }

    pub async fn list_node_bucket(&self) -> Result<Vec<VmRecord>, DaemonError> {
        let prefix = format!("state/{}/", self.node_id);
        let entries = self.storage.list(&prefix).await?;
        entries
            .into_iter()
            .map(|(_, v)| {
                serde_json::from_str(&v).map_err(|e| DaemonError::from(StorageError::Serialization(e.to_string())))
            })
            .collect()
    }

    pub async fn load_stopped(&self, instance_id: &str) -> Result<Option<VmRecord>, DaemonError> {
        match self.storage.get(&Self::stopped_key(instance_id)).await? {
            Some(json) => Ok(Some(
                serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Migrates `vm` from the per-node bucket into the cluster-shared
    /// stopped bucket, stamping `last_node` (§3.3, §6.4).
    pub async fn move_to_shared(&self, mut vm: VmRecord) -> Result<(), DaemonError> {
        vm.last_node = self.node_id.clone();
        let json = serde_json::to_string(&vm).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.put(&Self::stopped_key(&vm.instance_id), &json).await?;
        self.storage.delete(&self.node_key(&vm.instance_id)).await?;
        Ok(())
    }

    /// Migrates a previously-stopped record into this node's bucket,
    /// triggered by `StartInstances` picking a node with capacity (§3.3).
    pub async fn claim_from_shared(&self, instance_id: &str) -> Result<Option<VmRecord>, DaemonError> {
        let Some(vm) = self.load_stopped(instance_id).await? else {
            return Ok(None);
        };
        let json = serde_json::to_string(&vm).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.put(&self.node_key(instance_id), &json).await?;
        self.storage.delete(&Self::stopped_key(instance_id)).await?;
        Ok(Some(vm))
    }
}
