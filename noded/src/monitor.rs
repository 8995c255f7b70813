// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hypervisor monitor transport (§4.4.3, added): a typed request/response
//! channel to a running VM's QEMU monitor, behind a [`HypervisorMonitor`]
//! trait so C4/C5 unit tests run against an in-memory fake instead of a
//! real unix socket.

use async_trait::async_trait;
use common::error::DaemonError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Mutex;

/// One block device as reported by `query-block`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockDeviceEntry {
    pub device: String,
    pub qdev: String,
}

#[async_trait]
pub trait HypervisorMonitor: Send + Sync {
    async fn object_add(&self, object_type: &str, id: &str) -> Result<(), DaemonError>;
    async fn blockdev_add(&self, driver: &str, node_name: &str, uri: &str) -> Result<(), DaemonError>;
    async fn blockdev_del(&self, node_name: &str) -> Result<(), DaemonError>;
    async fn object_del(&self, id: &str) -> Result<(), DaemonError>;
    async fn device_add(
        &self,
        id: &str,
        driver: &str,
        backing_node: &str,
        root_port: &str,
    ) -> Result<(), DaemonError>;
    async fn device_del(&self, id: &str) -> Result<(), DaemonError>;
    async fn query_block(&self) -> Result<Vec<BlockDeviceEntry>, DaemonError>;
    async fn shutdown(&self) -> Result<(), DaemonError>;
}

#[derive(Serialize)]
struct MonitorCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct MonitorReply {
    #[serde(default)]
    #[serde(rename = "return")]
    return_value: Option<serde_json::Value>,
    error: Option<MonitorErrorBody>,
}

#[derive(Deserialize)]
struct MonitorErrorBody {
    desc: String,
}

/// Real implementation: newline-delimited JSON over a unix socket, matching
/// the QMP wire shape.
pub struct UnixSocketMonitor {
    stream: Mutex<BufReader<UnixStream>>,
}

impl UnixSocketMonitor {
    pub async fn connect(path: &str) -> Result<Self, DaemonError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| DaemonError::ServerInternal(format!("monitor connect {path}: {e}")))?;
        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
        })
    }

    async fn call(&self, execute: &str, arguments: Option<serde_json::Value>) -> Result<serde_json::Value, DaemonError> {
        let mut guard = self.stream.lock().await;
        let command = MonitorCommand { execute, arguments };
        let mut line = serde_json::to_string(&command)
            .map_err(|e| DaemonError::ServerInternal(format!("monitor encode: {e}")))?;
        line.push('\n');
        guard
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| DaemonError::ServerInternal(format!("monitor write: {e}")))?;

        let mut response = String::new();
        guard
            .read_line(&mut response)
            .await
            .map_err(|e| DaemonError::ServerInternal(format!("monitor read: {e}")))?;
        let reply: MonitorReply = serde_json::from_str(&response)
            .map_err(|e| DaemonError::ServerInternal(format!("monitor decode: {e}")))?;

        if let Some(error) = reply.error {
            return Err(DaemonError::ServerInternal(format!("{execute} failed: {}", error.desc)));
        }
        Ok(reply.return_value.unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl HypervisorMonitor for UnixSocketMonitor {
    async fn object_add(&self, object_type: &str, id: &str) -> Result<(), DaemonError> {
        self.call("object-add", Some(serde_json::json!({"qom-type": object_type, "id": id})))
            .await?;
        Ok(())
    }

    async fn blockdev_add(&self, driver: &str, node_name: &str, uri: &str) -> Result<(), DaemonError> {
        self.call(
            "blockdev-add",
            Some(serde_json::json!({"driver": driver, "node-name": node_name, "server": uri})),
        )
        .await?;
        Ok(())
    }

    async fn blockdev_del(&self, node_name: &str) -> Result<(), DaemonError> {
        self.call("blockdev-del", Some(serde_json::json!({"node-name": node_name})))
            .await?;
        Ok(())
    }

    async fn object_del(&self, id: &str) -> Result<(), DaemonError> {
        self.call("object-del", Some(serde_json::json!({"id": id}))).await?;
        Ok(())
    }

    async fn device_add(
        &self,
        id: &str,
        driver: &str,
        backing_node: &str,
        root_port: &str,
    ) -> Result<(), DaemonError> {
        self.call(
            "device_add",
            Some(serde_json::json!({
                "driver": driver,
                "id": id,
                "drive": backing_node,
                "bus": root_port,
            })),
        )
        .await?;
        Ok(())
    }

    async fn device_del(&self, id: &str) -> Result<(), DaemonError> {
        self.call("device_del", Some(serde_json::json!({"id": id}))).await?;
        Ok(())
    }

    async fn query_block(&self) -> Result<Vec<BlockDeviceEntry>, DaemonError> {
        let value = self.call("query-block", None).await?;
        serde_json::from_value(value).map_err(|e| DaemonError::ServerInternal(format!("query-block decode: {e}")))
    }

    async fn shutdown(&self) -> Result<(), DaemonError> {
        self.call("system_powerdown", None).await?;
        Ok(())
    }
}

/// In-memory fake used by C4/C5 unit tests. Records every call and lets
/// tests pre-seed `query_block` results or force a method to fail.
#[derive(Default)]
pub struct FakeMonitor {
    pub calls: Mutex<Vec<String>>,
    pub block_devices: Mutex<Vec<BlockDeviceEntry>>,
    pub fail: Mutex<HashMap<String, String>>,
}

impl FakeMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failure(&self, call: &str, message: &str) {
        self.fail.lock().await.insert(call.to_string(), message.to_string());
    }

    async fn check(&self, call: &str) -> Result<(), DaemonError> {
        self.calls.lock().await.push(call.to_string());
        if let Some(msg) = self.fail.lock().await.get(call) {
            return Err(DaemonError::ServerInternal(msg.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorMonitor for FakeMonitor {
    async fn object_add(&self, _object_type: &str, id: &str) -> Result<(), DaemonError> {
        self.check(&format!("object_add:{id}")).await
    }

    async fn blockdev_add(&self, _driver: &str, node_name: &str, _uri: &str) -> Result<(), DaemonError> {
        self.check(&format!("blockdev_add:{node_name}")).await
    }

    async fn blockdev_del(&self, node_name: &str) -> Result<(), DaemonError> {
        self.check(&format!("blockdev_del:{node_name}")).await
    }

    async fn object_del(&self, id: &str) -> Result<(), DaemonError> {
        self.check(&format!("object_del:{id}")).await
    }

    async fn device_add(&self, id: &str, _driver: &str, _backing_node: &str, _root_port: &str) -> Result<(), DaemonError> {
        self.check(&format!("device_add:{id}")).await
    }

    async fn device_del(&self, id: &str) -> Result<(), DaemonError> {
        self.check(&format!("device_del:{id}")).await
    }

    async fn query_block(&self) -> Result<Vec<BlockDeviceEntry>, DaemonError> {
        self.check("query_block").await?;
        Ok(self.block_devices.lock().await.clone())
    }

    async fn shutdown(&self) -> Result<(), DaemonError> {
        self.check("shutdown").await
    }
}

/// Connects to (or fakes) the per-instance monitor socket, letting the
/// Instance Supervisor obtain a [`HypervisorMonitor`] without knowing
/// whether it is talking to a real QEMU process or a test double.
#[async_trait]
pub trait MonitorFactory: Send + Sync {
    async fn connect(&self, socket_path: &str) -> Result<std::sync::Arc<dyn HypervisorMonitor>, DaemonError>;
}

pub struct UnixSocketMonitorFactory;

#[async_trait]
impl MonitorFactory for UnixSocketMonitorFactory {
    async fn connect(&self, socket_path: &str) -> Result<std::sync::Arc<dyn HypervisorMonitor>, DaemonError> {
        let monitor = UnixSocketMonitor::connect(socket_path).await?;
        Ok(std::sync::Arc::new(monitor))
    }
}

/// Test double: one [`FakeMonitor`] per socket path, created on first use
/// and reused, so tests can inspect calls made against a given instance.
#[derive(Default)]
pub struct FakeMonitorFactory {
    monitors: Mutex<HashMap<String, std::sync::Arc<FakeMonitor>>>,
}

impl FakeMonitorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn monitor_for(&self, socket_path: &str) -> std::sync::Arc<FakeMonitor> {
        self.monitors
            .lock()
            .await
            .entry(socket_path.to_string())
            .or_insert_with(|| std::sync::Arc::new(FakeMonitor::new()))
            .clone()
    }
}

#[async_trait]
impl MonitorFactory for FakeMonitorFactory {
    async fn connect(&self, socket_path: &str) -> Result<std::sync::Arc<dyn HypervisorMonitor>, DaemonError> {
        let monitor = self.monitor_for(socket_path).await;
        Ok(monitor as std::sync::Arc<dyn HypervisorMonitor>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_monitor_records_calls_in_order() {
        let monitor = FakeMonitor::new();
        monitor.object_add("iothread", "ioth-vol-1").await.unwrap();
        monitor.blockdev_add("nbd", "nbd-vol-1", "nbd://host:1").await.unwrap();
        let calls = monitor.calls.lock().await;
        assert_eq!(calls.as_slice(), ["object_add:ioth-vol-1", "blockdev_add:nbd-vol-1"]);
    }

    #[tokio::test]
    async fn fake_monitor_injected_failure_returns_error() {
        let monitor = FakeMonitor::new();
        monitor.set_failure("blockdev_del:nbd-vol-1", "device busy").await;
        let err = monitor.blockdev_del("nbd-vol-1").await.unwrap_err();
        assert_eq!(err.code(), "ServerInternal");
    }
}
