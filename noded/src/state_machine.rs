// SPDX-FileCopyrightText: Copyright 2024 LG Electronics Inc.
// SPDX-License-Identifier: Apache-2.0

//! State Machine (C3): the allowed transition graph over [`InstanceState`]
//! and the transition operation that validates, mutates, and persists a VM
//! record under a single critical section (§3.2, §4.2).

use crate::state_store::StateStore;
use common::error::DaemonError;
use common::types::{InstanceState, VmRecord};

/// `(from, to)` is allowed iff `to` appears in `from`'s edge list (§3.2).
fn allowed_targets(state: InstanceState) -> &'static [InstanceState] {
    use InstanceState::*;
    match state {
        Provisioning => &[Running, Error, ShuttingDown],
        Pending => &[Running, Error, ShuttingDown],
        Running => &[Stopping, ShuttingDown, Error],
        Stopping => &[Stopped, ShuttingDown, Error],
        Stopped => &[Running, ShuttingDown, Error],
        ShuttingDown => &[Terminated, Error],
        Error => &[Running, ShuttingDown],
        Terminated => &[],
    }
}

pub fn can_transition(from: InstanceState, to: InstanceState) -> bool {
    allowed_targets(from).contains(&to)
}

/// Validates `(vm.state, target)`, mutates in place, and persists via
/// `store`. Rejects self-transitions and transitions absent from the graph
/// with `InvalidTransition`, leaving `vm` untouched.
pub async fn transition(
    vm: &mut VmRecord,
    target: InstanceState,
    store: &StateStore,
) -> Result<(), DaemonError> {
    if vm.state == target || !can_transition(vm.state, target) {
        return Err(DaemonError::InvalidTransition(format!(
            "{} -> {} is not a valid transition for instance {}",
            vm.state, target, vm.instance_id
        )));
    }
    vm.state = target;
    store.save(vm).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::persistence::InMemoryStorage;
    use common::types::{HealthCounters, InstanceState::*};
    use std::sync::Arc;

    fn sample_vm() -> VmRecord {
        VmRecord {
            instance_id: "i-1".into(),
            instance_type: "t3.micro".into(),
            state: Pending,
            image_id: "ami-1".into(),
            reservation_id: "r-1".into(),
            owner_id: "acct-1".into(),
            launch_time: chrono::Utc::now(),
            key_name: None,
            subnet_id: None,
            block_device_mappings: Vec::new(),
            volumes: Vec::new(),
            pid: None,
            monitor_socket: None,
            health: HealthCounters::default(),
            last_node: "node-a".into(),
            stop_requested: false,
        }
    }

    #[test]
    fn no_self_transitions() {
        assert!(!can_transition(Running, Running));
    }

    #[test]
    fn every_non_terminal_state_has_an_outgoing_edge() {
        for state in [Provisioning, Pending, Running, Stopping, Stopped, ShuttingDown, Error] {
            assert!(!allowed_targets(state).is_empty(), "{state:?} has no outgoing edge");
        }
    }

    #[test]
    fn every_transitional_state_has_a_direct_edge_to_a_stable_state() {
        for state in [Provisioning, Pending, Stopping, ShuttingDown] {
            assert!(
                allowed_targets(state).iter().any(|s| s.is_stable()),
                "{state:?} has no direct edge to a stable state"
            );
        }
    }

    #[test]
    fn every_state_reaches_terminated() {
        for start in [Provisioning, Pending, Running, Stopping, Stopped, ShuttingDown, Error, Terminated] {
            assert!(reaches_terminated(start), "{start:?} cannot reach Terminated");
        }
    }

    fn reaches_terminated(start: InstanceState) -> bool {
        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![start];
        while let Some(s) = stack.pop() {
            if s == Terminated {
                return true;
            }
            if !visited.insert(s) {
                continue;
            }
            stack.extend(allowed_targets(s));
        }
        false
    }

    #[tokio::test]
    async fn transition_rejects_invalid_edge_and_leaves_state_unchanged() {
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let mut vm = sample_vm();
        vm.state = Terminated;
        let err = transition(&mut vm, Running, &store).await.unwrap_err();
        assert_eq!(err.code(), "InvalidTransition");
        assert_eq!(vm.state, Terminated);
    }

    #[tokio::test]
    async fn transition_persists_new_state() {
        let store = StateStore::new(Arc::new(InMemoryStorage::new()), "node-a".into());
        let mut vm = sample_vm();
        transition(&mut vm, Running, &store).await.unwrap();
        let loaded = store.load("i-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, Running);
    }
}
