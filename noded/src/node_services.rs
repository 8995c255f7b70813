// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Node Services (C8): thin read-only handlers over C1/C2/C4 state for the
//! four long-lived, no-queue-group fan-out topics (§4.5, §4.7). Each
//! handler only reads; no handler mutates VM or capacity state.

use crate::resource_manager::ResourceManager;
use crate::supervisor::Supervisor;
use common::bus::Bus;
use common::requests::{
    InstanceTypeAvailability, NodeDiscoverResponse, NodeHealthResponse, NodeStatusResponse, NodeVmsResponse, VmSummary,
};
use common::types::ClusterConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

pub struct NodeServices {
    supervisor: Arc<Supervisor>,
    resource_manager: Arc<ResourceManager>,
    bus: Arc<dyn Bus>,
    cluster_config: ClusterConfig,
    started_at: Instant,
}

impl NodeServices {
    pub fn new(
        supervisor: Arc<Supervisor>,
        resource_manager: Arc<ResourceManager>,
        bus: Arc<dyn Bus>,
        cluster_config: ClusterConfig,
    ) -> Self {
        Self {
            supervisor,
            resource_manager,
            bus,
            cluster_config,
            started_at: Instant::now(),
        }
    }

    fn node_id(&self) -> &str {
        self.resource_manager.node_id()
    }

    pub fn discover(&self) -> NodeDiscoverResponse {
        NodeDiscoverResponse {
            node: self.node_id().to_string(),
        }
    }

    pub fn health(&self) -> NodeHealthResponse {
        NodeHealthResponse {
            node: self.node_id().to_string(),
            status: "healthy".to_string(),
            config_hash: self.cluster_config.config_hash(),
            epoch: self.cluster_config.epoch,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }

    pub async fn status(&self) -> NodeStatusResponse {
        let (total_vcpu, total_mem_gib, allocated_vcpu, allocated_mem_gib, per_type): (
            u32,
            f64,
            u32,
            f64,
            Vec<InstanceTypeAvailability>,
        ) = self.resource_manager.stats().await;
        NodeStatusResponse {
            total_vcpu,
            total_mem_gib,
            allocated_vcpu,
            allocated_mem_gib,
            per_type_availability: per_type,
        }
    }

    pub async fn vms(&self) -> NodeVmsResponse {
        let vms = self.supervisor.vms();
        let vms = vms.read().await;
        let summaries = vms
            .values()
            .map(|v| VmSummary {
                instance_id: v.instance_id.clone(),
                instance_type: v.instance_type.clone(),
                state: v.state.public_state().1.to_string(),
                launch_time: v.launch_time,
            })
            .collect();
        NodeVmsResponse { vms: summaries }
    }

    /// Subscribes all four fan-out topics and serves them until the caller
    /// aborts the returned handles (typically at shutdown).
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let node_id = self.node_id().to_string();
        vec![
            self.spawn_discover(),
            self.spawn_health(format!("hive.admin.{node_id}.health")),
            self.spawn_status(),
            self.spawn_vms(),
        ]
    }

    fn spawn_discover(self: &Arc<Self>) -> JoinHandle<()> {
        let services = self.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let subject = "hive.nodes.discover";
            let mut sub = match bus.subscribe(subject, None).await {
                Ok(sub) => sub,
                Err(e) => return warn_subscribe(subject, e),
            };
            while let Some(msg) = sub.next().await {
                reply_json(&*bus, &msg, subject, services.discover()).await;
            }
        })
    }

    fn spawn_health(self: &Arc<Self>, subject: String) -> JoinHandle<()> {
        let services = self.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let mut sub = match bus.subscribe(&subject, None).await {
                Ok(sub) => sub,
                Err(e) => return warn_subscribe(&subject, e),
            };
            while let Some(msg) = sub.next().await {
                reply_json(&*bus, &msg, &subject, services.health()).await;
            }
        })
    }

    fn spawn_status(self: &Arc<Self>) -> JoinHandle<()> {
        let services = self.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let subject = "hive.node.status";
            let mut sub = match bus.subscribe(subject, None).await {
                Ok(sub) => sub,
                Err(e) => return warn_subscribe(subject, e),
            };
            while let Some(msg) = sub.next().await {
                reply_json(&*bus, &msg, subject, services.status().await).await;
            }
        })
    }

    fn spawn_vms(self: &Arc<Self>) -> JoinHandle<()> {
        let services = self.clone();
        let bus = self.bus.clone();
        tokio::spawn(async move {
            let subject = "hive.node.vms";
            let mut sub = match bus.subscribe(subject, None).await {
                Ok(sub) => sub,
                Err(e) => return warn_subscribe(subject, e),
            };
            while let Some(msg) = sub.next().await {
                reply_json(&*bus, &msg, subject, services.vms().await).await;
            }
        })
    }
}

fn warn_subscribe(subject: &str, e: common::error::TransportError) {
    tracing::warn!(subject, error = %e, "failed to subscribe fan-out topic");
}

async fn reply_json<T: serde::Serialize>(bus: &dyn Bus, msg: &common::bus::BusMessage, subject: &str, body: T) {
    match serde_json::to_vec(&body) {
        Ok(payload) => {
            if let Err(e) = common::bus::reply(bus, msg, payload).await {
                tracing::warn!(subject, error = %e, "failed to reply");
            }
        }
        Err(e) => tracing::warn!(subject, error = %e, "failed to encode response"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::monitor::FakeMonitorFactory;
    use crate::objectstore::InMemoryObjectStore;
    use crate::process::FakeProcessLauncher;
    use crate::state_store::StateStore;
    use crate::volume::VolumeEngine;
    use common::bus::InMemoryBus;
    use common::config::Settings;
    use common::persistence::InMemoryStorage;
    use common::types::{InstanceType, NodeConfig};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn cluster_config() -> ClusterConfig {
        let mut nodes = HashMap::new();
        nodes.insert(
            "node-a".to_string(),
            NodeConfig {
                node_id: "node-a".into(),
                bus_url: "nats://localhost:4222".into(),
                availability_zone: Some("az-1".into()),
                total_vcpus: 8,
                total_memory_gib: 16.0,
            },
        );
        ClusterConfig {
            epoch: 3,
            version: "v1".into(),
            node_id: "node-a".into(),
            nodes,
        }
    }

    async fn build_services() -> Arc<NodeServices> {
        let bus = Arc::new(InMemoryBus::new());
        let (work_tx, _work_rx) = tokio::sync::mpsc::unbounded_channel();
        let (start_tx, _start_rx) = tokio::sync::mpsc::unbounded_channel();
        let resource_manager = Arc::new(ResourceManager::new(
            vec![InstanceType {
                name: "t3.micro".into(),
                vcpus: 2,
                memory_mib: 1024,
                architecture: "x86_64".into(),
                current_generation: true,
                burstable: true,
            }],
            8,
            16384,
            bus.clone(),
            work_tx,
            start_tx,
            "node-a".into(),
        ));
        let store = Arc::new(StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into()));
        let volumes = Arc::new(VolumeEngine::new(bus.clone(), "node-a".into(), Duration::from_secs(1), Duration::ZERO));
        let object_store = Arc::new(InMemoryObjectStore::new());
        let (cmd_tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cmd_tx));
        let supervisor = Arc::new(Supervisor::new(
            "node-a".into(),
            None,
            resource_manager.clone(),
            store,
            volumes,
            object_store,
            Arc::new(FakeProcessLauncher),
            Arc::new(FakeMonitorFactory::new()),
            dispatcher,
            Arc::new(AtomicBool::new(false)),
            Settings::default(),
            std::env::temp_dir().to_string_lossy().to_string(),
        ));
        Arc::new(NodeServices::new(supervisor, resource_manager, bus, cluster_config()))
    }

    #[tokio::test]
    async fn discover_reports_this_node() {
        let services = build_services().await;
        assert_eq!(services.discover().node, "node-a");
    }

    #[tokio::test]
    async fn health_reports_cluster_config_hash_and_epoch() {
        let services = build_services().await;
        let health = services.health();
        assert_eq!(health.epoch, 3);
        assert_eq!(health.config_hash, cluster_config().config_hash());
    }

    #[tokio::test]
    async fn status_reports_total_capacity() {
        let services = build_services().await;
        let status = services.status().await;
        assert_eq!(status.total_vcpu, 8);
        assert_eq!(status.per_type_availability.len(), 1);
    }

    #[tokio::test]
    async fn vms_is_empty_before_any_launch() {
        let services = build_services().await;
        assert!(services.vms().await.vms.is_empty());
    }
}
