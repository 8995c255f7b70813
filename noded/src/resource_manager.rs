// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resource Manager (C1): host vCPU/memory accounting, the generated
//! instance-type table, and the dynamic per-type bus subscriptions that
//! make capacity-aware admission a property of the bus rather than a
//! central scheduler (§4.1).

use crate::cpu::CpuDetector;
use common::bus::{Bus, BusMessage};
use common::error::DaemonError;
use common::requests::InstanceTypeAvailability;
use common::types::InstanceType;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const WORKER_QUEUE_GROUP: &str = "hive-workers";

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    allocated_vcpu: u32,
    allocated_mem_mib: u64,
}

struct Inner {
    types: HashMap<String, InstanceType>,
    counters: Counters,
    total_vcpu: u32,
    total_mem_mib: u64,
}

impl Inner {
    fn can_allocate(&self, type_name: &str, n: u32) -> Result<u32, DaemonError> {
        let t = self
            .types
            .get(type_name)
            .ok_or_else(|| DaemonError::InvalidInstanceType(type_name.to_string()))?;

        let avail_vcpu_slots = if t.vcpus == 0 {
            u32::MAX
        } else {
            ((self.total_vcpu.saturating_sub(self.counters.allocated_vcpu)) / t.vcpus).max(0)
        };
        let avail_mem_slots = if t.memory_mib == 0 {
            u32::MAX
        } else {
            ((self.total_mem_mib.saturating_sub(self.counters.allocated_mem_mib)) / t.memory_mib)
                .min(u32::MAX as u64) as u32
        };
        Ok(n.min(avail_vcpu_slots).min(avail_mem_slots))
    }
}

/// Host capacity tracker and bus-subscription-diffing admission controller.
///
/// Maintains two parallel subscription sets keyed by instance type —
/// `ec2.RunInstances.<type>` (new instances) and `ec2.StartInstances.<type>`
/// (resuming a stopped instance from the shared bucket, §3.3) — since a
/// node's admissibility for one is identical to the other: both just need
/// room for one more instance of that type.
pub struct ResourceManager {
    inner: Mutex<Inner>,
    bus: Arc<dyn Bus>,
    work_tx: mpsc::UnboundedSender<BusMessage>,
    start_tx: mpsc::UnboundedSender<BusMessage>,
    subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    start_subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    node_id: String,
}

impl ResourceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        types: Vec<InstanceType>,
        total_vcpu: u32,
        total_mem_mib: u64,
        bus: Arc<dyn Bus>,
        work_tx: mpsc::UnboundedSender<BusMessage>,
        start_tx: mpsc::UnboundedSender<BusMessage>,
        node_id: String,
    ) -> Self {
        let types = types.into_iter().map(|t| (t.name.clone(), t)).collect();
        Self {
            inner: Mutex::new(Inner {
                types,
                counters: Counters::default(),
                total_vcpu,
                total_mem_mib,
            }),
            bus,
            work_tx,
            start_tx,
            subscriptions: Mutex::new(HashMap::new()),
            start_subscriptions: Mutex::new(HashMap::new()),
            node_id,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn from_detected(
        detector: &dyn CpuDetector,
        total_vcpu: u32,
        total_mem_mib: u64,
        bus: Arc<dyn Bus>,
        work_tx: mpsc::UnboundedSender<BusMessage>,
        start_tx: mpsc::UnboundedSender<BusMessage>,
        node_id: String,
    ) -> Self {
        let types = crate::cpu::generate_instance_types(detector);
        Self::new(types, total_vcpu, total_mem_mib, bus, work_tx, start_tx, node_id)
    }

    pub async fn can_allocate(&self, type_name: &str, n: u32) -> Result<u32, DaemonError> {
        self.inner.lock().await.can_allocate(type_name, n)
    }

    pub async fn allocate(&self, type_name: &str) -> Result<(), DaemonError> {
        let mut inner = self.inner.lock().await;
        let t = inner
            .types
            .get(type_name)
            .cloned()
            .ok_or_else(|| DaemonError::InvalidInstanceType(type_name.to_string()))?;
        inner.counters.allocated_vcpu += t.vcpus;
        inner.counters.allocated_mem_mib += t.memory_mib;
        Ok(())
    }

    pub async fn deallocate(&self, type_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(t) = inner.types.get(type_name).cloned() {
            inner.counters.allocated_vcpu = inner.counters.allocated_vcpu.saturating_sub(t.vcpus);
            inner.counters.allocated_mem_mib =
                inner.counters.allocated_mem_mib.saturating_sub(t.memory_mib);
        }
    }

    /// All types that fit at least once; `expand` repeats each type by its
    /// remaining slot count, for reporting only — the scheduler always calls
    /// [`Self::can_allocate`] directly (§9).
    pub async fn list_available_types(&self, expand: bool) -> Vec<InstanceType> {
        let inner = self.inner.lock().await;
        let mut out = Vec::new();
        for t in inner.types.values() {
            let slots = inner.can_allocate(&t.name, u32::MAX).unwrap_or(0);
            if slots == 0 {
                continue;
            }
            if expand {
                for _ in 0..slots {
                    out.push(t.clone());
                }
            } else {
                out.push(t.clone());
            }
        }
        out
    }

    pub async fn stats(&self) -> (u32, f64, u32, f64, Vec<InstanceTypeAvailability>) {
        let inner = self.inner.lock().await;
        let per_type = inner
            .types
            .values()
            .map(|t| InstanceTypeAvailability {
                name: t.name.clone(),
                available: inner.can_allocate(&t.name, u32::MAX).unwrap_or(0),
            })
            .collect();
        (
            inner.total_vcpu,
            inner.total_mem_mib as f64 / 1024.0,
            inner.counters.allocated_vcpu,
            inner.counters.allocated_mem_mib as f64 / 1024.0,
            per_type,
        )
    }

    /// Recomputes which types currently accept at least one more instance
    /// and diff-applies subscriptions: subscribe to newly-admissible types,
    /// unsubscribe from types that no longer fit. Call after every
    /// allocate/deallocate and once at boot (§4.1).
    pub async fn sync_subscriptions(&self) {
        // Held across read + compute + apply: `allocate`/`deallocate` also
        // take this lock, so a concurrent allocation can't land between the
        // admissible-set computation and the subscription diff being
        // applied and leave the two inconsistent (§9).
        let inner = self.inner.lock().await;
        let admissible: HashSet<String> = inner
            .types
            .keys()
            .filter(|name| inner.can_allocate(name, 1).unwrap_or(0) > 0)
            .cloned()
            .collect();

        let mut subs = self.subscriptions.lock().await;
        Self::diff_apply(&self.bus, &admissible, &mut subs, "ec2.RunInstances", "RunInstances", &self.work_tx).await;

        let mut start_subs = self.start_subscriptions.lock().await;
        Self::diff_apply(
            &self.bus,
            &admissible,
            &mut start_subs,
            "ec2.StartInstances",
            "StartInstances",
            &self.start_tx,
        )
        .await;
    }

    /// Subscribes newly-admissible `<subject_prefix>.<type>` topics and
    /// unsubscribes ones that no longer fit, forwarding matched messages to
    /// `tx`. Shared by the `RunInstances` and `StartInstances` subscription
    /// sets, whose admissibility rule is identical.
    async fn diff_apply(
        bus: &Arc<dyn Bus>,
        admissible: &HashSet<String>,
        subs: &mut HashMap<String, JoinHandle<()>>,
        subject_prefix: &str,
        label: &str,
        tx: &mpsc::UnboundedSender<BusMessage>,
    ) {
        let currently: HashSet<String> = subs.keys().cloned().collect();

        for type_name in currently.difference(admissible) {
            if let Some(handle) = subs.remove(type_name) {
                handle.abort();
                tracing::info!(instance_type = %type_name, label, "unsubscribed topic, no longer admissible");
            }
        }

        for type_name in admissible.difference(&currently) {
            let subject = format!("{subject_prefix}.{type_name}");
            match bus.subscribe(&subject, Some(WORKER_QUEUE_GROUP)).await {
                Ok(mut sub) => {
                    let tx = tx.clone();
                    let handle = tokio::spawn(async move {
                        while let Some(msg) = sub.next().await {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                    });
                    subs.insert(type_name.clone(), handle);
                    tracing::info!(instance_type = %type_name, label, "subscribed topic, capacity available");
                }
                Err(e) => {
                    tracing::warn!(instance_type = %type_name, label, error = %e, "failed to subscribe topic");
                }
            }
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::bus::InMemoryBus;

    fn sample_type(name: &str, vcpus: u32, mem_mib: u64) -> InstanceType {
        InstanceType {
            name: name.to_string(),
            vcpus,
            memory_mib: mem_mib,
            architecture: "x86_64".into(),
            current_generation: true,
            burstable: false,
        }
    }

    fn manager(total_vcpu: u32, total_mem_mib: u64) -> (ResourceManager, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (start_tx, _start_rx) = mpsc::unbounded_channel();
        let bus = Arc::new(InMemoryBus::new());
        let rm = ResourceManager::new(
            vec![sample_type("c6i.large", 2, 4096), sample_type("c6i.xlarge", 4, 8192)],
            total_vcpu,
            total_mem_mib,
            bus,
            tx,
            start_tx,
            "node-a".into(),
        );
        (rm, rx)
    }

    #[tokio::test]
    async fn can_allocate_clamps_to_remaining_capacity() {
        let (rm, _rx) = manager(4, 8192);
        assert_eq!(rm.can_allocate("c6i.large", 5).await.unwrap(), 2);
        rm.allocate("c6i.large").await.unwrap();
        assert_eq!(rm.can_allocate("c6i.large", 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn can_allocate_unknown_type_errors() {
        let (rm, _rx) = manager(4, 8192);
        let err = rm.can_allocate("bogus.type", 1).await.unwrap_err();
        assert_eq!(err.code(), "InvalidInstanceType");
    }

    #[tokio::test]
    async fn deallocate_restores_capacity() {
        let (rm, _rx) = manager(2, 4096);
        rm.allocate("c6i.large").await.unwrap();
        assert_eq!(rm.can_allocate("c6i.large", 1).await.unwrap(), 0);
        rm.deallocate("c6i.large").await;
        assert_eq!(rm.can_allocate("c6i.large", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn sync_subscriptions_unsubscribes_when_capacity_exhausted() {
        let (rm, _rx) = manager(2, 4096);
        rm.sync_subscriptions().await;
        assert_eq!(rm.subscriptions.lock().await.len(), 1); // only c6i.large fits

        rm.allocate("c6i.large").await.unwrap();
        rm.sync_subscriptions().await;
        assert_eq!(rm.subscriptions.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn start_subscriptions_mirror_run_subscriptions() {
        let (rm, _rx) = manager(2, 4096);
        rm.sync_subscriptions().await;
        assert_eq!(rm.start_subscriptions.lock().await.len(), 1); // only c6i.large fits

        rm.allocate("c6i.large").await.unwrap();
        rm.sync_subscriptions().await;
        assert_eq!(rm.start_subscriptions.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn list_available_types_expand_repeats_by_slot_count() {
        let (rm, _rx) = manager(8, 16384);
        let expanded = rm.list_available_types(true).await;
        let plain = rm.list_available_types(false).await;
        assert!(expanded.len() > plain.len());
    }
}
