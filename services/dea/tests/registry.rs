//! Registry and accounting properties under arbitrary add/remove sequences.

use std::collections::HashSet;
use std::sync::Arc;

use dea_agent::{DropletCollection, DropletInstance, Monitor};
use dea_messages::{InstanceState, StartRequest};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add { droplet: u8, mem: u64 },
    Remove(usize),
    Stop(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4, 1u64..8).prop_map(|(droplet, mem)| Op::Add { droplet, mem: mem * 64 }),
        any::<usize>().prop_map(Op::Remove),
        any::<usize>().prop_map(Op::Stop),
    ]
}

fn request(droplet: u8, mem: u64) -> StartRequest {
    serde_json::from_value(serde_json::json!({
        "droplet": format!("d{droplet}"),
        "index": 0,
        "name": format!("app{droplet}"),
        "runtime": "sh",
        "version": "v1",
        "limits": { "mem": mem }
    }))
    .unwrap()
}

proptest! {
    #[test]
    fn prop_registry_and_monitor_stay_consistent(ops in prop::collection::vec(op(), 1..64)) {
        let dir = tempfile::TempDir::new().unwrap();
        let droplets = DropletCollection::new(dir.path().join("snapshot.json"));
        let monitor = Monitor::new(u64::MAX, u64::MAX);
        let mut live: Vec<(Arc<DropletInstance>, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Add { droplet, mem } => {
                    let instance = droplets.create_instance(&request(droplet, mem));
                    prop_assert!(monitor.add_instance_resources(&instance));
                    prop_assert!(!monitor.add_instance_resources(&instance));
                    prop_assert!(droplets.find(instance.droplet_id(), instance.instance_id()).is_some());
                    live.push((instance, mem));
                }
                Op::Remove(k) if !live.is_empty() => {
                    let (instance, _) = live.remove(k % live.len());
                    monitor.remove_instance_resources(&instance);
                    prop_assert!(droplets.remove_instance(&instance));
                    prop_assert!(!droplets.remove_instance(&instance));
                    prop_assert!(droplets.find(instance.droplet_id(), instance.instance_id()).is_none());
                }
                Op::Stop(k) if !live.is_empty() => {
                    let (instance, _) = &live[k % live.len()];
                    let _ = instance.write().set_state(InstanceState::Stopped);
                }
                _ => {}
            }

            prop_assert!(!droplets.has_empty_droplet());
            prop_assert_eq!(droplets.instance_count(), live.len());
            let distinct: HashSet<_> = live.iter().map(|(i, _)| i.droplet_id().clone()).collect();
            prop_assert_eq!(droplets.droplet_count(), distinct.len());
            prop_assert_eq!(monitor.clients(), live.len() as u64);
            prop_assert_eq!(monitor.reserved_memory_mb(), live.iter().map(|(_, mem)| mem).sum::<u64>());

            let monitorable = live.iter().any(|(i, _)| i.state().is_monitorable());
            prop_assert_eq!(droplets.no_monitorable_apps(), !monitorable);
        }
    }

    #[test]
    fn prop_snapshot_reloads_every_instance(count in 0usize..8) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db").join("applications.json");
        let droplets = DropletCollection::new(&path);
        let mut ids = HashSet::new();
        for n in 0..count {
            ids.insert(droplets.create_instance(&request((n % 3) as u8, 64)).instance_id());
        }

        droplets.snapshot_app_state().unwrap();
        let loaded = DropletCollection::load_snapshot(&path).unwrap();

        prop_assert_eq!(loaded.len(), count);
        let loaded_ids: HashSet<_> = loaded.iter().map(|p| p.instance_id).collect();
        prop_assert_eq!(loaded_ids, ids);
        prop_assert!(loaded.iter().all(|p| p.state == InstanceState::Starting));
    }
}
