// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request Dispatcher (C6): per-instance command subscriptions and the
//! fan-out subscription set. Per-type worker topics are owned by the
//! Resource Manager, not duplicated here (§4.5).

use common::bus::{Bus, BusMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Owns the `HashMap<String, JoinHandle<()>>` of active per-instance-command
/// subscriptions, added on launch/recovery and removed on terminate or
/// node handoff (§4.5, added).
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    instance_subscriptions: Mutex<HashMap<String, JoinHandle<()>>>,
    fanout_subscriptions: Mutex<Vec<JoinHandle<()>>>,
    command_tx: mpsc::UnboundedSender<BusMessage>,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn Bus>, command_tx: mpsc::UnboundedSender<BusMessage>) -> Self {
        Self {
            bus,
            instance_subscriptions: Mutex::new(HashMap::new()),
            fanout_subscriptions: Mutex::new(Vec::new()),
            command_tx,
        }
    }

    /// Subscribes `ec2.cmd.<instance_id>`, forwarding every message to the
    /// command channel consumed by the Instance Supervisor.
    pub async fn register_instance(&self, instance_id: &str) {
        let subject = format!("ec2.cmd.{instance_id}");
        let mut subs = self.instance_subscriptions.lock().await;
        if subs.contains_key(instance_id) {
            return;
        }
        match self.bus.subscribe(&subject, None).await {
            Ok(mut sub) => {
                let tx = self.command_tx.clone();
                let handle = tokio::spawn(async move {
                    while let Some(msg) = sub.next().await {
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                });
                subs.insert(instance_id.to_string(), handle);
            }
            Err(e) => {
                tracing::warn!(instance_id, error = %e, "failed to subscribe instance command topic");
            }
        }
    }

    /// Removed on terminate or when the instance hands off to another node.
    pub async fn unregister_instance(&self, instance_id: &str) {
        if let Some(handle) = self.instance_subscriptions.lock().await.remove(instance_id) {
            handle.abort();
        }
    }

    /// Subscribes the long-lived, no-queue-group fan-out topics exactly
    /// once at startup (§4.5, §4.7).
    pub async fn start_fanout(&self, subjects: &[&str], fanout_tx: mpsc::UnboundedSender<BusMessage>) {
        let mut handles = self.fanout_subscriptions.lock().await;
        for subject in subjects {
            match self.bus.subscribe(subject, None).await {
                Ok(mut sub) => {
                    let tx = fanout_tx.clone();
                    handles.push(tokio::spawn(async move {
                        while let Some(msg) = sub.next().await {
                            if tx.send(msg).is_err() {
                                break;
                            }
                        }
                    }));
                }
                Err(e) => {
                    tracing::warn!(subject, error = %e, "failed to subscribe fan-out topic");
                }
            }
        }
    }

    pub async fn active_instance_count(&self) -> usize {
        self.instance_subscriptions.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::bus::InMemoryBus;

    #[tokio::test]
    async fn register_then_unregister_removes_subscription() {
        let bus = Arc::new(InMemoryBus::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(bus, tx);

        dispatcher.register_instance("i-1").await;
        assert_eq!(dispatcher.active_instance_count().await, 1);
        dispatcher.unregister_instance("i-1").await;
        assert_eq!(dispatcher.active_instance_count().await, 0);
    }

    #[tokio::test]
    async fn registered_instance_forwards_command_messages() {
        let bus = Arc::new(InMemoryBus::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher::new(bus.clone(), tx);
        dispatcher.register_instance("i-1").await;

        bus.publish("ec2.cmd.i-1", b"{\"action\":\"StopInstance\"}".to_vec())
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "ec2.cmd.i-1");
    }
}
