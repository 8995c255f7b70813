// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Recovery Controller (C7): runs once at startup, before worker-queue
//! subscriptions open, reconciling this node's persisted VM records
//! against reality after an unclean restart (§4.6).

use crate::supervisor::Supervisor;
use common::error::DaemonError;
use common::types::{InstanceState, VmRecord};

/// `kill(pid, 0)`: `ESRCH` means the process is gone, anything else
/// (including `EPERM`) still proves the pid exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// A `Running` record's pid can be reused by an unrelated process across a
/// restart; a stale monitor socket that refuses to connect is the
/// corroborating signal that the original hypervisor is actually gone.
async fn guest_is_live(supervisor: &Supervisor, vm: &VmRecord) -> bool {
    let Some(pid) = vm.pid else { return false };
    if !is_pid_alive(pid) {
        return false;
    }
    match &vm.monitor_socket {
        Some(socket) => supervisor.monitor_factory().connect(socket).await.is_ok(),
        None => false,
    }
}

/// Walks this node's persisted bucket once and reconciles each record
/// against process liveness per the table in §4.6. Never aborts on a
/// single bad record; logs and moves on so one corrupt entry doesn't
/// block the rest of the fleet from coming back up.
pub async fn run(supervisor: &Supervisor) -> Result<(), DaemonError> {
    let records = supervisor.store().list_node_bucket().await?;
    tracing::info!(count = records.len(), "recovery: reconciling persisted records");

    for vm in records {
        let instance_id = vm.instance_id.clone();
        let state = vm.state;
        let outcome = reconcile_one(supervisor, vm).await;
        match outcome {
            Ok(()) => tracing::info!(instance_id, ?state, "recovery: reconciled"),
            Err(e) => tracing::warn!(instance_id, ?state, error = %e, "recovery: reconcile failed"),
        }
    }
    Ok(())
}

async fn reconcile_one(supervisor: &Supervisor, vm: VmRecord) -> Result<(), DaemonError> {
    match vm.state {
        InstanceState::Running => {
            if guest_is_live(supervisor, &vm).await {
                supervisor.resume_live(vm).await
            } else {
                supervisor.resume_dead(vm).await
            }
        }
        InstanceState::Error | InstanceState::Pending | InstanceState::Provisioning => {
            supervisor.resume_dead(vm).await
        }
        InstanceState::Stopping => supervisor.finalize_stopping(vm).await,
        InstanceState::ShuttingDown => supervisor.finalize_shutting_down(vm).await,
        InstanceState::Stopped => {
            if vm.stop_requested {
                supervisor.migrate_stopped(vm).await
            } else {
                supervisor.retain(vm).await;
                Ok(())
            }
        }
        InstanceState::Terminated => {
            supervisor.retain(vm).await;
            Ok(())
        }
    }
}
