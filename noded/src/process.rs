// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hypervisor child process spawning, behind a [`ProcessLauncher`] trait so
//! the Instance Supervisor's launch/watchdog logic can be unit-tested
//! without a real QEMU binary (§4.3 step 4, §5).

use async_trait::async_trait;
use common::error::DaemonError;
use tokio::process::{Child, Command};

pub struct ChildHandle {
    pub pid: u32,
    pub child: Child,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawns the hypervisor child for `instance_id` with `disks` as
    /// `(device_name, uri)` pairs, a monitor socket at `monitor_socket`,
    /// and a serial console log at `serial_log`.
    async fn spawn(
        &self,
        instance_id: &str,
        disks: &[(String, String)],
        monitor_socket: &str,
        serial_log: &str,
    ) -> Result<ChildHandle, DaemonError>;
}

/// Real implementation: shells out to `qemu-system-x86_64` (out of scope to
/// fully flesh out the argument surface; this core owns the spawn/monitor
/// contract, not the QEMU CLI translation).
pub struct QemuProcessLauncher {
    pub binary: String,
}

impl Default for QemuProcessLauncher {
    fn default() -> Self {
        Self {
            binary: "qemu-system-x86_64".to_string(),
        }
    }
}

#[async_trait]
impl ProcessLauncher for QemuProcessLauncher {
    async fn spawn(
        &self,
        instance_id: &str,
        disks: &[(String, String)],
        monitor_socket: &str,
        serial_log: &str,
    ) -> Result<ChildHandle, DaemonError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-name")
            .arg(instance_id)
            .arg("-qmp")
            .arg(format!("unix:{monitor_socket},server,nowait"))
            .arg("-serial")
            .arg(format!("file:{serial_log}"));
        for (device_name, uri) in disks {
            command
                .arg("-drive")
                .arg(format!("if=none,id={device_name},file={uri}"));
        }
        let mut child = command
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::ServerInternal(format!("spawn hypervisor for {instance_id}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| DaemonError::ServerInternal("hypervisor child has no pid".to_string()))?;
        Ok(ChildHandle { pid, child })
    }
}

/// Test double: spawns a harmless long-lived child (`sleep`) so watchdog
/// tests can observe a real PID and a real exit without QEMU.
pub struct FakeProcessLauncher;

#[async_trait]
impl ProcessLauncher for FakeProcessLauncher {
    async fn spawn(
        &self,
        _instance_id: &str,
        _disks: &[(String, String)],
        _monitor_socket: &str,
        _serial_log: &str,
    ) -> Result<ChildHandle, DaemonError> {
        let mut child = Command::new("sleep")
            .arg("3600")
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DaemonError::ServerInternal(format!("spawn fake process: {e}")))?;
        let pid = child.id().unwrap_or(0);
        Ok(ChildHandle { pid, child })
    }
}

/// Classification of a watchdog-observed exit: `clean-exit`, `oom-killed`
/// (SIGKILL), `exit-<code>` for any other non-zero exit, `unknown`
/// otherwise (§4.3 Crash handling).
pub fn classify_exit(status: std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    if status.success() {
        return "clean-exit".to_string();
    }
    if let Some(sig) = status.signal() {
        return if sig == libc::SIGKILL {
            "oom-killed".to_string()
        } else {
            "unknown".to_string()
        };
    }
    match status.code() {
        Some(code) => format!("exit-{code}"),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn classify_clean_exit() {
        assert_eq!(classify_exit(std::process::ExitStatus::from_raw(0)), "clean-exit");
    }

    #[test]
    fn classify_sigkill_as_oom() {
        assert_eq!(classify_exit(std::process::ExitStatus::from_raw(libc::SIGKILL)), "oom-killed");
    }

    #[test]
    fn classify_nonzero_exit_code() {
        assert_eq!(classify_exit(std::process::ExitStatus::from_raw(512)), "exit-2");
    }
}
