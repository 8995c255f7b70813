// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-node hypervisor control daemon.
//!
//! Boots the Resource Manager (C1) against the detected host CPU, restores
//! this node's persisted VM records via the Recovery Controller (C7) before
//! any worker-queue subscription opens, then starts the Request Dispatcher
//! (C6) fan-out/worker topics and Node Services (C8) read-only handlers.

mod cpu;
mod dispatcher;
mod monitor;
mod node_services;
mod objectstore;
mod process;
mod recovery;
mod resource_manager;
mod state_machine;
mod state_store;
mod supervisor;
mod volume;

use anyhow::Result;
use clap::Parser;
use common::bus::{Bus, NatsBus};
use common::config::{load_cluster_config, load_settings};
use common::error::DaemonError;
use common::persistence::{EtcdStorage, Storage};
use cpu::LinuxCpuDetector;
use dispatcher::Dispatcher;
use monitor::UnixSocketMonitorFactory;
use node_services::NodeServices;
use objectstore::InMemoryObjectStore;
use process::QemuProcessLauncher;
use resource_manager::ResourceManager;
use state_store::StateStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use volume::VolumeEngine;

#[derive(Parser, Debug)]
#[command(name = "noded")]
#[command(about = "Per-node hypervisor control daemon")]
struct Args {
    /// Node settings file (falls back to compiled-in defaults if absent).
    #[arg(short, long, default_value = "/etc/noded/noded")]
    config: String,

    /// Overrides the `cluster_config_path` setting when set.
    #[arg(long)]
    cluster_config: Option<String>,

    /// Log level, honors `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for per-instance monitor sockets and serial logs.
    #[arg(long, default_value = "/var/run/noded")]
    runtime_dir: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    common::logging::init_logging("noded", &args.log_level)?;

    let settings = load_settings(&args.config);
    let cluster_config_path = args.cluster_config.as_deref().unwrap_or(&settings.cluster_config_path);
    let cluster_config = load_cluster_config(cluster_config_path)?;
    let node_config = cluster_config
        .nodes
        .get(&settings.node_id)
        .ok_or_else(|| anyhow::anyhow!("node {} missing from cluster config", settings.node_id))?
        .clone();

    info!(node_id = %settings.node_id, epoch = cluster_config.epoch, "starting noded");

    let bus: Arc<dyn Bus> = Arc::new(NatsBus::connect(&settings.bus_url).await?);
    let storage: Arc<dyn Storage> = Arc::new(EtcdStorage::connect(&settings.etcd_endpoints).await?);
    let store = Arc::new(StateStore::new(storage, settings.node_id.clone()));

    let (work_tx, mut work_rx) = tokio::sync::mpsc::unbounded_channel();
    let (start_tx, mut start_rx) = tokio::sync::mpsc::unbounded_channel();
    let resource_manager = Arc::new(ResourceManager::from_detected(
        &LinuxCpuDetector,
        node_config.total_vcpus,
        (node_config.total_memory_gib * 1024.0) as u64,
        bus.clone(),
        work_tx,
        start_tx,
        settings.node_id.clone(),
    ));

    let volumes = Arc::new(VolumeEngine::new(
        bus.clone(),
        settings.node_id.clone(),
        Duration::from_secs(settings.bus_request_timeout_secs),
        Duration::from_millis(settings.detach_pause_ms),
    ));
    let object_store = Arc::new(InMemoryObjectStore::new());

    let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel();
    let dispatcher = Arc::new(Dispatcher::new(bus.clone(), cmd_tx));
    let shutting_down = Arc::new(AtomicBool::new(false));

    let supervisor = Arc::new(supervisor::Supervisor::new(
        settings.node_id.clone(),
        node_config.availability_zone.clone(),
        resource_manager.clone(),
        store,
        volumes,
        object_store,
        Arc::new(QemuProcessLauncher::default()),
        Arc::new(UnixSocketMonitorFactory),
        dispatcher.clone(),
        shutting_down.clone(),
        settings.clone(),
        args.runtime_dir.clone(),
    ));

    recovery::run(&supervisor).await?;

    resource_manager.sync_subscriptions().await;

    let node_services = Arc::new(NodeServices::new(
        supervisor.clone(),
        resource_manager.clone(),
        bus.clone(),
        cluster_config,
    ));
    let service_handles = node_services.spawn();

    let command_loop = tokio::spawn(run_command_loop(supervisor.clone(), bus.clone(), cmd_rx));
    let work_loop = tokio::spawn(run_work_loop(supervisor.clone(), bus.clone(), work_rx));
    let start_loop = tokio::spawn(run_start_loop(supervisor.clone(), bus.clone(), start_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    shutting_down.store(true, Ordering::SeqCst);

    for handle in service_handles {
        handle.abort();
    }
    command_loop.abort();
    work_loop.abort();
    start_loop.abort();

    info!("noded shutdown complete");
    Ok(())
}

/// Drains `ec2.cmd.<instance_id>` commands forwarded by the dispatcher.
async fn run_command_loop(
    supervisor: Arc<supervisor::Supervisor>,
    bus: Arc<dyn Bus>,
    mut cmd_rx: tokio::sync::mpsc::UnboundedReceiver<common::bus::BusMessage>,
) {
    while let Some(msg) = cmd_rx.recv().await {
        let supervisor = supervisor.clone();
        let bus = bus.clone();
        tokio::spawn(async move { dispatch_command(&supervisor, &*bus, msg).await });
    }
}

async fn dispatch_command(supervisor: &supervisor::Supervisor, bus: &dyn Bus, msg: common::bus::BusMessage) {
    let Some(instance_id) = msg.subject.strip_prefix("ec2.cmd.").map(str::to_string) else {
        return;
    };
    let command: common::requests::InstanceCommand = match serde_json::from_slice(&msg.payload) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(instance_id, error = %e, "failed to decode instance command");
            return;
        }
    };
    use common::requests::InstanceCommand::*;
    match command {
        StopInstance => reply_result(bus, &msg, supervisor.stop_instance(&instance_id).await).await,
        TerminateInstance => reply_result(bus, &msg, supervisor.terminate_instance(&instance_id).await).await,
        StartInstance => {
            // `ec2.cmd.<id>` only ever reaches an instance already resident
            // in some node's live VM map; a stopped instance has no
            // subscriber here; it's `ec2.StartInstances.<type>` (the admission
            // topic, served by `run_start_loop`) that claims it instead.
            tracing::warn!(instance_id, "StartInstance on an already-resident instance is a no-op");
        }
        AttachVolume {
            volume_id,
            device_name,
            boot,
            efi,
            cloud_init,
            delete_on_termination,
        } => {
            let outcome = supervisor
                .attach_volume(&instance_id, &volume_id, device_name, None, boot, efi, cloud_init, delete_on_termination)
                .await
                .map(|device_name| common::requests::AttachVolumeResponse {
                    volume_id: volume_id.clone(),
                    device_name,
                    instance_id: instance_id.clone(),
                });
            reply_result(bus, &msg, outcome).await;
        }
        DetachVolume {
            volume_id,
            device_name,
            force,
        } => {
            let outcome = supervisor
                .detach_volume(&instance_id, &volume_id, device_name.as_deref(), force)
                .await
                .map(|()| common::requests::DetachVolumeResponse {
                    volume_id: volume_id.clone(),
                    instance_id: instance_id.clone(),
                });
            reply_result(bus, &msg, outcome).await;
        }
    }
}

/// Drains `ec2.RunInstances.<type>` requests the Resource Manager is
/// currently subscribed to.
async fn run_work_loop(
    supervisor: Arc<supervisor::Supervisor>,
    bus: Arc<dyn Bus>,
    mut work_rx: tokio::sync::mpsc::UnboundedReceiver<common::bus::BusMessage>,
) {
    while let Some(msg) = work_rx.recv().await {
        let supervisor = supervisor.clone();
        let bus = bus.clone();
        tokio::spawn(async move { serve_run_instances(&supervisor, &*bus, msg).await });
    }
}

async fn serve_run_instances(supervisor: &supervisor::Supervisor, bus: &dyn Bus, msg: common::bus::BusMessage) {
    let request: common::requests::RunInstancesRequest = match serde_json::from_slice(&msg.payload) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode RunInstances request");
            return;
        }
    };
    let outcome = supervisor.run_instances(request).await;
    reply_result(bus, &msg, outcome).await;
}

/// Drains `ec2.StartInstances.<type>` requests the Resource Manager is
/// currently subscribed to, claiming a stopped instance of that type out of
/// the shared bucket onto this node (§3.3).
async fn run_start_loop(
    supervisor: Arc<supervisor::Supervisor>,
    bus: Arc<dyn Bus>,
    mut start_rx: tokio::sync::mpsc::UnboundedReceiver<common::bus::BusMessage>,
) {
    while let Some(msg) = start_rx.recv().await {
        let supervisor = supervisor.clone();
        let bus = bus.clone();
        tokio::spawn(async move { serve_start_instance(&supervisor, &*bus, msg).await });
    }
}

async fn serve_start_instance(supervisor: &supervisor::Supervisor, bus: &dyn Bus, msg: common::bus::BusMessage) {
    let request: common::requests::StartInstancesRequest = match serde_json::from_slice(&msg.payload) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode StartInstances request");
            return;
        }
    };
    let outcome = supervisor
        .start_instance(&request.instance_id)
        .await
        .map(|instance| common::requests::StartInstanceResponse { instance });
    reply_result(bus, &msg, outcome).await;
}

/// Replies on `msg.reply_to` (if the caller asked for one) with the
/// serialized success payload, or an [`ErrorPayload`] on failure (§6.2).
async fn reply_result<T: serde::Serialize>(bus: &dyn Bus, msg: &common::bus::BusMessage, outcome: Result<T, DaemonError>) {
    if msg.reply_to.is_none() {
        if let Err(e) = &outcome {
            tracing::warn!(subject = %msg.subject, error = %e, "command failed (no reply_to set)");
        }
        return;
    }
    let payload = match outcome {
        Ok(body) => serde_json::to_vec(&body),
        Err(e) => serde_json::to_vec(&common::requests::ErrorPayload::from(&e)),
    };
    match payload {
        Ok(payload) => {
            if let Err(e) = common::bus::reply(bus, msg, payload).await {
                tracing::warn!(subject = %msg.subject, error = %e, "failed to reply");
            }
        }
        Err(e) => tracing::warn!(subject = %msg.subject, error = %e, "failed to encode reply"),
    }
}
