// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Instance Supervisor (C4): launches, monitors, stops, and terminates VMs.
//! Owns the child hypervisor process, its monitor channel, PID/socket
//! cleanup, crash classification, and bounded restart (§4.3).

use crate::dispatcher::Dispatcher;
use crate::monitor::MonitorFactory;
use crate::process::{classify_exit, ProcessLauncher};
use crate::resource_manager::ResourceManager;
use crate::state_machine;
use crate::state_store::StateStore;
use crate::volume::VolumeEngine;
use common::config::Settings;
use common::error::DaemonError;
use common::requests::{ReservationResponse, RunInstancesRequest};
use common::types::{BlockDeviceMapping, HealthCounters, InstanceState, VmRecord, VolumeRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::objectstore::ObjectStoreClient;

pub struct Supervisor {
    node_id: String,
    availability_zone: Option<String>,
    vms: Arc<RwLock<HashMap<String, VmRecord>>>,
    resource_manager: Arc<ResourceManager>,
    store: Arc<StateStore>,
    volumes: Arc<VolumeEngine>,
    object_store: Arc<dyn ObjectStoreClient>,
    process_launcher: Arc<dyn ProcessLauncher>,
    monitor_factory: Arc<dyn MonitorFactory>,
    dispatcher: Arc<Dispatcher>,
    shutting_down: Arc<AtomicBool>,
    settings: Settings,
    runtime_dir: String,
}

#[allow(clippy::too_many_arguments)]
impl Supervisor {
    pub fn new(
        node_id: String,
        availability_zone: Option<String>,
        resource_manager: Arc<ResourceManager>,
        store: Arc<StateStore>,
        volumes: Arc<VolumeEngine>,
        object_store: Arc<dyn ObjectStoreClient>,
        process_launcher: Arc<dyn ProcessLauncher>,
        monitor_factory: Arc<dyn MonitorFactory>,
        dispatcher: Arc<Dispatcher>,
        shutting_down: Arc<AtomicBool>,
        settings: Settings,
        runtime_dir: String,
    ) -> Self {
        Self {
            node_id,
            availability_zone,
            vms: Arc::new(RwLock::new(HashMap::new())),
            resource_manager,
            store,
            volumes,
            object_store,
            process_launcher,
            monitor_factory,
            dispatcher,
            shutting_down,
            settings,
            runtime_dir,
        }
    }

    pub fn vms(&self) -> Arc<RwLock<HashMap<String, VmRecord>>> {
        self.vms.clone()
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    pub fn resource_manager(&self) -> Arc<ResourceManager> {
        self.resource_manager.clone()
    }

    pub fn monitor_factory(&self) -> Arc<dyn MonitorFactory> {
        self.monitor_factory.clone()
    }

    /// Inserts a record recovered from persistence directly into the live
    /// VM map, bypassing `run_instances` (§4.6).
    pub async fn adopt(&self, vm: VmRecord) {
        self.vms.write().await.insert(vm.instance_id.clone(), vm);
    }

    fn monitor_socket_path(&self, instance_id: &str) -> String {
        format!("{}/{}.qmp.sock", self.runtime_dir, instance_id)
    }

    fn serial_log_path(&self, instance_id: &str) -> String {
        format!("{}/{}.serial.log", self.runtime_dir, instance_id)
    }

    /// `RunInstances`: validates in order (§4.3), reserves capacity, then
    /// runs the per-instance launch pipeline concurrently for every
    /// instance in the reservation.
    pub async fn run_instances(&self, request: RunInstancesRequest) -> Result<ReservationResponse, DaemonError> {
        let owner_id = request.owner_id.clone();
        if !self.object_store.ami_exists(&request.image_id).await {
            return Err(DaemonError::InvalidAmiNotFound(request.image_id.clone()));
        }
        if let Some(key_name) = &request.key_name {
            if self.object_store.resolve_key_pair(key_name).await.is_none() {
                return Err(DaemonError::InvalidKeyPairNotFound(key_name.clone()));
            }
        }
        // Existence check for the instance type, ignoring capacity.
        self.resource_manager.can_allocate(&request.instance_type, 0).await?;

        if request.min_count < 1 || request.min_count > request.max_count {
            return Err(DaemonError::InvalidParameterValue(format!(
                "invalid min/max count {}/{}",
                request.min_count, request.max_count
            )));
        }

        let k = self
            .resource_manager
            .can_allocate(&request.instance_type, request.max_count)
            .await?;
        if k < request.min_count {
            return Err(DaemonError::InsufficientInstanceCapacity(request.instance_type.clone()));
        }

        let reservation_id = format!("r-{}", uuid::Uuid::new_v4());
        let mut instance_ids = Vec::with_capacity(k as usize);
        for _ in 0..k {
            self.resource_manager.allocate(&request.instance_type).await?;
            let instance_id = format!("i-{}", uuid::Uuid::new_v4());
            let vm = VmRecord {
                instance_id: instance_id.clone(),
                instance_type: request.instance_type.clone(),
                state: InstanceState::Pending,
                image_id: request.image_id.clone(),
                reservation_id: reservation_id.clone(),
                owner_id: owner_id.clone(),
                launch_time: chrono::Utc::now(),
                key_name: request.key_name.clone(),
                subnet_id: request.subnet_id.clone(),
                block_device_mappings: Vec::new(),
                volumes: Vec::new(),
                pid: None,
                monitor_socket: None,
                health: HealthCounters::default(),
                last_node: self.node_id.clone(),
                stop_requested: false,
            };
            self.store.save(&vm).await?;
            self.vms.write().await.insert(instance_id.clone(), vm);
            instance_ids.push(instance_id);
        }
        self.resource_manager.sync_subscriptions().await;

        let pipelines = instance_ids
            .iter()
            .map(|id| self.launch_new(id, &request));
        futures_util::future::join_all(pipelines).await;

        let vms_guard = self.vms.read().await;
        let instances = instance_ids
            .iter()
            .filter_map(|id| vms_guard.get(id).cloned())
            .collect();
        Ok(ReservationResponse {
            reservation_id,
            owner_id,
            instances,
        })
    }

    /// Per-instance launch pipeline (§4.3): volumes, mount, spawn, transition,
    /// watchdog. Resources were already reserved by the caller.
    async fn launch_new(&self, instance_id: &str, request: &RunInstancesRequest) {
        if let Err(e) = self.launch_new_inner(instance_id, request).await {
            tracing::warn!(instance_id, error = %e, "launch failed, rolling back");
            self.fail_launch(instance_id, &e.to_string()).await;
        }
    }

    async fn launch_new_inner(&self, instance_id: &str, request: &RunInstancesRequest) -> Result<(), DaemonError> {
        let root_dot = request
            .block_device_mappings
            .iter()
            .find(|m| m.device_name == "/dev/sda1")
            .map(|m| m.delete_on_termination)
            .unwrap_or(true);

        let mut volumes = vec![
            VolumeRequest {
                volume_id: format!("vol-root-{instance_id}"),
                device_name: "/dev/sda1".to_string(),
                boot: true,
                efi: false,
                cloud_init: false,
                delete_on_termination: root_dot,
                uri: None,
            },
            VolumeRequest {
                volume_id: format!("vol-efi-{instance_id}"),
                device_name: "/dev/sda2".to_string(),
                boot: false,
                efi: true,
                cloud_init: false,
                delete_on_termination: true,
                uri: None,
            },
            VolumeRequest {
                volume_id: format!("vol-cloudinit-{instance_id}"),
                device_name: "/dev/sda3".to_string(),
                boot: false,
                efi: false,
                cloud_init: true,
                delete_on_termination: true,
                uri: None,
            },
        ];

        let mut mounted = Vec::new();
        for volume in volumes.iter_mut() {
            match self.volumes.mount(&volume.volume_id, &volume.device_name).await {
                Ok(uri) => {
                    volume.uri = Some(uri);
                    mounted.push(volume.volume_id.clone());
                }
                Err(e) => {
                    for id in &mounted {
                        self.volumes.unmount(id).await;
                    }
                    return Err(e);
                }
            }
        }

        let disks: Vec<(String, String)> = volumes
            .iter()
            .map(|v| (v.device_name.clone(), v.uri.clone().unwrap_or_default()))
            .collect();
        let monitor_socket = self.monitor_socket_path(instance_id);
        let serial_log = self.serial_log_path(instance_id);

        let spawn_result = self
            .process_launcher
            .spawn(instance_id, &disks, &monitor_socket, &serial_log)
            .await;
        let child_handle = match spawn_result {
            Ok(h) => h,
            Err(e) => {
                for volume in &volumes {
                    self.volumes.unmount(&volume.volume_id).await;
                }
                return Err(e);
            }
        };

        {
            let mut vms = self.vms.write().await;
            let vm = vms
                .get_mut(instance_id)
                .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
            vm.volumes = volumes;
            vm.block_device_mappings = vm
                .volumes
                .iter()
                .map(|v| BlockDeviceMapping {
                    device_name: v.device_name.clone(),
                    volume_id: v.volume_id.clone(),
                    delete_on_termination: v.delete_on_termination,
                })
                .collect();
            vm.pid = Some(child_handle.pid);
            vm.monitor_socket = Some(monitor_socket.clone());
            state_machine::transition(vm, InstanceState::Running, &self.store).await?;
        }

        self.dispatcher.register_instance(instance_id).await;
        self.spawn_watchdog(instance_id.to_string(), child_handle.child);
        Ok(())
    }

    /// Marks a failed launch `Error` with `reason`, after best-effort
    /// rollback already ran in the caller (§4.3).
    async fn fail_launch(&self, instance_id: &str, reason: &str) {
        let mut vms = self.vms.write().await;
        if let Some(vm) = vms.get_mut(instance_id) {
            vm.health.last_crash_reason = Some(reason.to_string());
            let _ = state_machine::transition(vm, InstanceState::Error, &self.store).await;
        }
        drop(vms);
        self.resource_manager.deallocate(&self.instance_type_of(instance_id).await).await;
        self.resource_manager.sync_subscriptions().await;
    }

    async fn instance_type_of(&self, instance_id: &str) -> String {
        self.vms
            .read()
            .await
            .get(instance_id)
            .map(|v| v.instance_type.clone())
            .unwrap_or_default()
    }

    fn spawn_watchdog(&self, instance_id: String, mut child: tokio::process::Child) {
        let supervisor = self.clone_handles();
        tokio::spawn(async move {
            let status = child.wait().await;
            let reason = match status {
                Ok(s) => classify_exit(s),
                Err(_) => "unknown".to_string(),
            };
            supervisor.on_child_exit(instance_id, reason).await;
        });
    }

    /// Polls an already-running, recovery-adopted process for liveness,
    /// since its `Child` handle was never held by this daemon instance
    /// (§4.6). Exits as soon as the PID disappears.
    pub fn spawn_poll_watchdog(&self, instance_id: String, pid: u32) {
        let supervisor = self.clone_handles();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            loop {
                interval.tick().await;
                if !crate::recovery::is_pid_alive(pid) {
                    supervisor.on_child_exit(instance_id, "unknown".to_string()).await;
                    return;
                }
                if supervisor.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
            }
        });
    }

    /// Shared crash-handling path for both a directly-spawned child's exit
    /// and a recovery-adopted process's disappearance (§4.3).
    async fn on_child_exit(&self, instance_id: String, reason: String) {
        let was_running = {
            let mut guard = self.vms.write().await;
            let Some(vm) = guard.get_mut(&instance_id) else {
                return;
            };
            let running = vm.state == InstanceState::Running;
            if running {
                let now = chrono::Utc::now();
                vm.health.crash_count += 1;
                if vm.health.first_crash_time.is_none() {
                    vm.health.first_crash_time = Some(now);
                }
                vm.health.last_crash_time = Some(now);
                vm.health.last_crash_reason = Some(reason.clone());
                vm.pid = None;
                vm.monitor_socket = None;
                let _ = state_machine::transition(vm, InstanceState::Error, &self.store).await;
            }
            running
        };

        if !was_running {
            return;
        }

        let instance_type = self
            .vms
            .read()
            .await
            .get(&instance_id)
            .map(|v| v.instance_type.clone())
            .unwrap_or_default();
        self.resource_manager.deallocate(&instance_type).await;
        self.resource_manager.sync_subscriptions().await;

        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::info!(instance_id, "crash observed during shutdown, not restarting");
            return;
        }

        let settings = self.settings.clone();
        self.decide_restart(&instance_id, &settings).await;
    }

    /// Restart policy after a crash (§4.3): crash-window reset, restart cap,
    /// and exponential backoff re-checked against current capacity.
    async fn decide_restart(&self, instance_id: &str, settings: &Settings) {
        let instance_type = {
            let mut vms = self.vms.write().await;
            let Some(vm) = vms.get_mut(instance_id) else { return };
            if vm.state != InstanceState::Error {
                return;
            }

            let crash_window = chrono::Duration::seconds(settings.crash_window_secs as i64);
            let now = chrono::Utc::now();
            if let Some(first) = vm.health.first_crash_time {
                if now - first > crash_window {
                    vm.health.crash_count = 1;
                    vm.health.restart_count = 0;
                    vm.health.first_crash_time = Some(now);
                }
            }

            if vm.health.crash_count > settings.max_restarts_in_window {
                tracing::warn!(instance_id, "crash count exceeds window cap, not restarting");
                return;
            }

            let exp = vm.health.restart_count.min(31);
            let delay_secs = (settings.restart_base_secs.saturating_mul(1u64 << exp)).min(settings.restart_max_secs);
            let instance_type = vm.instance_type.clone();
            let restart_count = vm.health.restart_count;
            drop(vms);

            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            tracing::info!(instance_id, delay_secs, restart_count, "restart delay elapsed");
            instance_type
        };

        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.resource_manager.can_allocate(&instance_type, 1).await.unwrap_or(0) == 0 {
            tracing::warn!(instance_id, "no capacity to restart, skipping");
            return;
        }

        let mut vms = self.vms.write().await;
        if let Some(vm) = vms.get_mut(instance_id) {
            vm.health.restart_count += 1;
        }
        drop(vms);

        if let Err(e) = self.resource_manager.allocate(&instance_type).await {
            tracing::warn!(instance_id, error = %e, "failed to re-allocate capacity for restart");
            return;
        }
        self.resource_manager.sync_subscriptions().await;
        if let Err(e) = self.relaunch(instance_id).await {
            tracing::warn!(instance_id, error = %e, "relaunch failed");
        }
    }

    /// Respawns the hypervisor for an already-known VM record whose
    /// volumes are still mounted (crash-restart and recovery, §4.6).
    pub async fn relaunch(&self, instance_id: &str) -> Result<(), DaemonError> {
        let disks: Vec<(String, String)> = {
            let vms = self.vms.read().await;
            let vm = vms
                .get(instance_id)
                .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
            vm.volumes
                .iter()
                .map(|v| (v.device_name.clone(), v.uri.clone().unwrap_or_default()))
                .collect()
        };

        let monitor_socket = self.monitor_socket_path(instance_id);
        let serial_log = self.serial_log_path(instance_id);
        let child_handle = self
            .process_launcher
            .spawn(instance_id, &disks, &monitor_socket, &serial_log)
            .await?;

        {
            let mut vms = self.vms.write().await;
            let vm = vms
                .get_mut(instance_id)
                .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
            vm.pid = Some(child_handle.pid);
            vm.monitor_socket = Some(monitor_socket);
            state_machine::transition(vm, InstanceState::Running, &self.store).await?;
        }

        self.dispatcher.register_instance(instance_id).await;
        self.spawn_watchdog(instance_id.to_string(), child_handle.child);
        Ok(())
    }

    /// Recovery (§4.6): re-admits a VM record recovered from persistence
    /// whose process is still alive, re-allocating capacity and
    /// re-registering dispatch and watchdog without touching its state.
    pub async fn resume_live(&self, vm: VmRecord) -> Result<(), DaemonError> {
        let instance_type = vm.instance_type.clone();
        let instance_id = vm.instance_id.clone();
        let pid = vm.pid;
        self.resource_manager.allocate(&instance_type).await?;
        self.adopt(vm).await;
        self.dispatcher.register_instance(&instance_id).await;
        if let Some(pid) = pid {
            self.spawn_poll_watchdog(instance_id, pid);
        }
        Ok(())
    }

    /// Recovery (§4.6): a VM record recovered from persistence whose
    /// process is gone. Adopts it, reserves capacity, and relaunches;
    /// marks `Error` on failure rather than propagating, so one bad
    /// record doesn't abort the rest of the recovery pass.
    pub async fn resume_dead(&self, mut vm: VmRecord) -> Result<(), DaemonError> {
        vm.pid = None;
        vm.monitor_socket = None;
        // `relaunch` only ever transitions *into* `Running`; a record still
        // marked `Running` whose process died has to leave that state first
        // (a valid edge, §3.2) or its own transition at the end of
        // `relaunch` would be a rejected self-transition.
        if vm.state == InstanceState::Running {
            state_machine::transition(&mut vm, InstanceState::Error, &self.store).await?;
        }
        let instance_type = vm.instance_type.clone();
        let instance_id = vm.instance_id.clone();
        self.resource_manager.allocate(&instance_type).await?;
        self.adopt(vm).await;
        self.resource_manager.sync_subscriptions().await;
        if let Err(e) = self.relaunch(&instance_id).await {
            tracing::warn!(instance_id, error = %e, "recovery relaunch failed, marking Error");
            let mut vms = self.vms.write().await;
            if let Some(vm) = vms.get_mut(&instance_id) {
                let _ = state_machine::transition(vm, InstanceState::Error, &self.store).await;
            }
            return Err(e);
        }
        Ok(())
    }

    /// `StartInstances` (§3.3): claims a record out of the cluster-shared
    /// stopped bucket onto this node and relaunches it. `claim_from_shared`
    /// is keyed globally by instance id, so whichever node's Resource
    /// Manager was admissible for the type wins the claim regardless of
    /// which node originally stopped it. Reuses `resume_dead`'s
    /// allocate/adopt/relaunch sequence: a claimed record is `Stopped`, a
    /// state `resume_dead`'s `Running`-specific pre-transition never
    /// touches, and `Stopped -> Running` is itself a valid edge for
    /// `relaunch`'s final transition.
    pub async fn start_instance(&self, instance_id: &str) -> Result<VmRecord, DaemonError> {
        let vm = self
            .store
            .claim_from_shared(instance_id)
            .await?
            .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
        self.resume_dead(vm).await?;
        let vms = self.vms.read().await;
        vms.get(instance_id)
            .cloned()
            .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))
    }

    /// Recovery (§4.6): finalizes a record caught mid-`Stopping` into
    /// `Stopped` and migrates it to the cluster-shared bucket.
    pub async fn finalize_stopping(&self, mut vm: VmRecord) -> Result<(), DaemonError> {
        state_machine::transition(&mut vm, InstanceState::Stopped, &self.store).await?;
        self.store.move_to_shared(vm).await
    }

    /// Recovery (§4.6): finalizes a record caught mid-`ShuttingDown` into
    /// `Terminated`, retained in the per-node bucket for audit.
    pub async fn finalize_shutting_down(&self, mut vm: VmRecord) -> Result<(), DaemonError> {
        state_machine::transition(&mut vm, InstanceState::Terminated, &self.store).await?;
        self.store.save(&vm).await?;
        self.adopt(vm).await;
        Ok(())
    }

    /// Recovery (§4.6): a `Stopped` record with `stop_requested` set
    /// belongs in the cluster-shared bucket, not this node's.
    pub async fn migrate_stopped(&self, vm: VmRecord) -> Result<(), DaemonError> {
        self.store.move_to_shared(vm).await
    }

    /// Recovery (§4.6): retained as-is (`Terminated`, or a `Stopped`
    /// record nobody asked to migrate).
    pub async fn retain(&self, vm: VmRecord) {
        self.adopt(vm).await;
    }

    /// `StopInstances` (§4.3): monitor shutdown, unmount (never delete
    /// user volumes), migrate to the shared stopped bucket.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<(), DaemonError> {
        self.shutdown_guest(instance_id).await?;
        self.teardown(instance_id, false).await
    }

    /// `TerminateInstances` (§4.3): same pipeline, deletes `deleteOnTermination`
    /// volumes; record stays in the per-node bucket as `Terminated`.
    pub async fn terminate_instance(&self, instance_id: &str) -> Result<(), DaemonError> {
        self.shutdown_guest(instance_id).await?;
        self.teardown(instance_id, true).await
    }

    /// `AttachVolume` (§4.4.1): connects the instance's monitor and runs the
    /// three-phase hot-plug protocol against its live VM record.
    #[allow(clippy::too_many_arguments)]
    pub async fn attach_volume(
        &self,
        instance_id: &str,
        volume_id: &str,
        requested_device: Option<String>,
        volume_zone: Option<&str>,
        boot: bool,
        efi: bool,
        cloud_init: bool,
        delete_on_termination: bool,
    ) -> Result<String, DaemonError> {
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(instance_id)
            .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
        let socket = vm
            .monitor_socket
            .clone()
            .ok_or_else(|| DaemonError::IncorrectInstanceState(format!("instance {instance_id} has no live monitor")))?;
        let monitor = self.monitor_factory.connect(&socket).await?;
        self.volumes
            .attach(
                vm,
                &*monitor,
                volume_id,
                requested_device,
                volume_zone,
                self.availability_zone.as_deref(),
                boot,
                efi,
                cloud_init,
                delete_on_termination,
                &self.store,
            )
            .await
    }

    /// `DetachVolume` (§4.4.2): same pipeline, reversed.
    pub async fn detach_volume(
        &self,
        instance_id: &str,
        volume_id: &str,
        expected_device: Option<&str>,
        force: bool,
    ) -> Result<(), DaemonError> {
        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(instance_id)
            .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
        let socket = vm
            .monitor_socket
            .clone()
            .ok_or_else(|| DaemonError::IncorrectInstanceState(format!("instance {instance_id} has no live monitor")))?;
        let monitor = self.monitor_factory.connect(&socket).await?;
        self.volumes
            .detach(vm, &*monitor, volume_id, expected_device, force, &self.store)
            .await
    }

    async fn shutdown_guest(&self, instance_id: &str) -> Result<(), DaemonError> {
        let monitor_socket = {
            let mut vms = self.vms.write().await;
            let vm = vms
                .get_mut(instance_id)
                .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
            vm.stop_requested = true;
            state_machine::transition(vm, InstanceState::Stopping, &self.store).await?;
            vm.monitor_socket.clone()
        };
        if let Some(socket) = monitor_socket {
            match self.monitor_factory.connect(&socket).await {
                Ok(monitor) => {
                    if let Err(e) = monitor.shutdown().await {
                        tracing::warn!(instance_id, error = %e, "monitor shutdown failed, continuing teardown");
                    }
                }
                Err(e) => tracing::warn!(instance_id, error = %e, "failed to connect monitor for shutdown"),
            }
        }
        Ok(())
    }

    async fn teardown(&self, instance_id: &str, delete_volumes: bool) -> Result<(), DaemonError> {
        let (volumes, instance_type) = {
            let vms = self.vms.read().await;
            let vm = vms
                .get(instance_id)
                .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
            (vm.volumes.clone(), vm.instance_type.clone())
        };

        for volume in &volumes {
            self.volumes.unmount(&volume.volume_id).await;
            if volume.is_internal() || (delete_volumes && volume.delete_on_termination) {
                self.volumes.delete(&volume.volume_id).await;
            }
        }

        self.dispatcher.unregister_instance(instance_id).await;
        self.resource_manager.deallocate(&instance_type).await;
        self.resource_manager.sync_subscriptions().await;

        let final_state = if delete_volumes {
            InstanceState::ShuttingDown
        } else {
            InstanceState::Stopped
        };

        let mut vms = self.vms.write().await;
        let vm = vms
            .get_mut(instance_id)
            .ok_or_else(|| DaemonError::InvalidInstanceIdNotFound(instance_id.to_string()))?;
        vm.pid = None;
        vm.monitor_socket = None;
        state_machine::transition(vm, final_state, &self.store).await?;

        if delete_volumes {
            state_machine::transition(vm, InstanceState::Terminated, &self.store).await?;
            let vm = vm.clone();
            drop(vms);
            self.store.save(&vm).await?;
        } else {
            let vm = vm.clone();
            drop(vms);
            self.store.move_to_shared(vm).await?;
            self.vms.write().await.remove(instance_id);
        }
        Ok(())
    }

    fn clone_handles(&self) -> Supervisor {
        Supervisor {
            node_id: self.node_id.clone(),
            availability_zone: self.availability_zone.clone(),
            vms: self.vms.clone(),
            resource_manager: self.resource_manager.clone(),
            store: self.store.clone(),
            volumes: self.volumes.clone(),
            object_store: self.object_store.clone(),
            process_launcher: self.process_launcher.clone(),
            monitor_factory: self.monitor_factory.clone(),
            dispatcher: self.dispatcher.clone(),
            shutting_down: self.shutting_down.clone(),
            settings: self.settings.clone(),
            runtime_dir: self.runtime_dir.clone(),
        }
    }

    pub fn availability_zone(&self) -> Option<&str> {
        self.availability_zone.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::FakeMonitorFactory;
    use crate::objectstore::{InMemoryObjectStore, KeyPairMeta};
    use crate::process::FakeProcessLauncher;
    use common::bus::InMemoryBus;
    use common::persistence::InMemoryStorage;

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.detach_pause_ms = 0;
        s
    }

    async fn responder(bus: Arc<InMemoryBus>, subject: String) {
        let mut sub = bus.subscribe(&subject, None).await.unwrap();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let reply = serde_json::to_vec(&common::requests::EbsMountReply {
                    uri: Some(format!("nbd://127.0.0.1:1/{}", uuid::Uuid::new_v4())),
                    mounted: true,
                    error: None,
                })
                .unwrap();
                common::bus::reply(&*bus, &msg, reply).await.unwrap();
            }
        });
    }

    async fn build_supervisor() -> (Supervisor, Arc<ResourceManager>) {
        let bus = Arc::new(InMemoryBus::new());
        responder(bus.clone(), "ebs.node-a.mount".to_string()).await;

        let (work_tx, _work_rx) = tokio::sync::mpsc::unbounded_channel();
        let (start_tx, _start_rx) = tokio::sync::mpsc::unbounded_channel();
        let resource_manager = Arc::new(ResourceManager::new(
            vec![common::types::InstanceType {
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
        object_store.seed_ami("ami-ok").await;
        object_store
            .seed_key_pair(KeyPairMeta {
                name: "my-key".into(),
                fingerprint: "aa".into(),
            })
            .await;
        let (cmd_tx, _cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cmd_tx));

        let supervisor = Supervisor::new(
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
            settings(),
            std::env::temp_dir().to_string_lossy().to_string(),
        );
        (supervisor, resource_manager)
    }

    #[tokio::test]
    async fn run_instances_rejects_unknown_ami() {
        let (supervisor, _rm) = build_supervisor().await;
        let request = RunInstancesRequest {
            owner_id: "acct-1".into(),
            image_id: "ami-missing".into(),
            instance_type: "t3.micro".into(),
            key_name: None,
            min_count: 1,
            max_count: 1,
            subnet_id: None,
            user_data: None,
            block_device_mappings: Vec::new(),
        };
        let err = supervisor.run_instances(request).await.unwrap_err();
        assert_eq!(err.code(), "InvalidAMIID.NotFound");
    }

    #[tokio::test]
    async fn run_instances_rejects_insufficient_capacity() {
        let (supervisor, _rm) = build_supervisor().await;
        let request = RunInstancesRequest {
            owner_id: "acct-1".into(),
            image_id: "ami-ok".into(),
            instance_type: "t3.micro".into(),
            key_name: None,
            min_count: 10,
            max_count: 10,
            subnet_id: None,
            user_data: None,
            block_device_mappings: Vec::new(),
        };
        let err = supervisor.run_instances(request).await.unwrap_err();
        assert_eq!(err.code(), "InsufficientInstanceCapacity");
    }

    #[tokio::test]
    async fn run_instances_launches_and_reaches_running() {
        let (supervisor, _rm) = build_supervisor().await;
        let request = RunInstancesRequest {
            owner_id: "acct-1".into(),
            image_id: "ami-ok".into(),
            instance_type: "t3.micro".into(),
            key_name: Some("my-key".into()),
            min_count: 1,
            max_count: 1,
            subnet_id: None,
            user_data: None,
            block_device_mappings: Vec::new(),
        };
        let reservation = supervisor.run_instances(request).await.unwrap();
        assert_eq!(reservation.instances.len(), 1);
        assert_eq!(reservation.instances[0].state, InstanceState::Running);
        assert_eq!(reservation.instances[0].volumes.len(), 3);
    }

    #[tokio::test]
    async fn stop_instance_moves_to_shared_bucket() {
        let (supervisor, _rm) = build_supervisor().await;
        let request = RunInstancesRequest {
            owner_id: "acct-1".into(),
            image_id: "ami-ok".into(),
            instance_type: "t3.micro".into(),
            key_name: None,
            min_count: 1,
            max_count: 1,
            subnet_id: None,
            user_data: None,
            block_device_mappings: Vec::new(),
        };
        let reservation = supervisor.run_instances(request).await.unwrap();
        let instance_id = reservation.instances[0].instance_id.clone();

        supervisor.stop_instance(&instance_id).await.unwrap();
        assert!(supervisor.vms.read().await.get(&instance_id).is_none());
    }

    #[tokio::test]
    async fn start_instance_claims_from_shared_bucket_and_relaunches() {
        let (supervisor, _rm) = build_supervisor().await;
        let request = RunInstancesRequest {
            owner_id: "acct-1".into(),
            image_id: "ami-ok".into(),
            instance_type: "t3.micro".into(),
            key_name: None,
            min_count: 1,
            max_count: 1,
            subnet_id: None,
            user_data: None,
            block_device_mappings: Vec::new(),
        };
        let reservation = supervisor.run_instances(request).await.unwrap();
        let instance_id = reservation.instances[0].instance_id.clone();
        supervisor.stop_instance(&instance_id).await.unwrap();

        let vm = supervisor.start_instance(&instance_id).await.unwrap();
        assert_eq!(vm.state, InstanceState::Running);
        assert!(supervisor.vms.read().await.contains_key(&instance_id));
    }

    #[tokio::test]
    async fn start_instance_unknown_id_errors() {
        let (supervisor, _rm) = build_supervisor().await;
        let err = supervisor.start_instance("i-missing").await.unwrap_err();
        assert_eq!(err.code(), "InvalidInstanceID.NotFound");
    }
}
