//! End-to-end tests of the agent over the in-process bus.
//!
//! Each test starts a node with the mock launcher, drives it with bus
//! messages the way the control plane would, and checks what the node
//! publishes back.


use std::time::Duration;

use bytes::Bytes;
use dea_agent::{AgentState, MessageBus};
use dea_messages::InstanceState;
use harness::{next_json, start_node, start_request, wait_until};

const MEM: u64 = 128;

#[tokio::test]
async fn test_start_publishes_heartbeat_and_route() {
    let node = start_node(&[]).await;
    let mut heartbeats = node.bus.subscribe("dea.heartbeat").unwrap();
    let mut routes = node.bus.subscribe("router.register").unwrap();

    node.start_running("blog", 0, MEM).await;

    let heartbeat = next_json(&mut heartbeats).await;
    let droplets = heartbeat["droplets"].as_array().unwrap();
    assert_eq!(droplets.len(), 1);
    assert_eq!(droplets[0]["droplet"], "blog");
    assert_eq!(droplets[0]["state"], "RUNNING");

    let route = next_json(&mut routes).await;
    assert_eq!(route["host"], "127.0.0.1");
    assert_eq!(route["uris"], serde_json::json!(["blog.example.com"]));
    assert_eq!(route["tags"]["runtime"], "sh");
    assert_eq!(route["dea"], node.config.node_id.to_string());

    // Environment handed to the launcher
    let launches = node.launcher.launches();
    assert_eq!(launches.len(), 1);
    let env = &launches[0].environment;
    let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    assert_eq!(get("GREETING"), Some("hello"));
    assert_eq!(get("LANG"), Some("C"));
    assert_eq!(get("VCAP_APP_HOST"), Some("127.0.0.1"));
    assert_eq!(get("VCAP_APP_PORT"), Some(route["port"].to_string().as_str()));

    // Staged directory with the runtime bound into the startup script
    let startup = std::fs::read_to_string(launches[0].dir.join("startup")).unwrap();
    assert!(!startup.contains("%VCAP_LOCAL_RUNTIME%"));
    assert!(launches[0].dir.join("app/run.sh").is_file());

    let instance = &node.agent.droplets().instances()[0];
    let props = instance.properties();
    assert!(props.pid.is_some());
    assert!(props.domain.is_some());
    assert!(props.environment_variables.contains_key("VCAP_APP_PID"));
    assert_eq!(node.agent.monitor().reserved_memory_mb(), MEM);
    assert_eq!(node.agent.monitor().clients(), 1);
}

#[tokio::test]
async fn test_start_rejected_without_memory() {
    let node = start_node(&[("DEA_MAX_MEMORY_MB", "256")]).await;
    let (bits_file, sha1) = node.write_droplet("big");
    let subject = format!("dea.{}.start", node.config.node_id);

    node.publish(&subject, start_request("big", 0, 512, &bits_file, &sha1));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(node.agent.droplets().is_empty());
    assert_eq!(node.agent.monitor().reserved_memory_mb(), 0);
    assert!(node.launcher.launches().is_empty());
}

#[tokio::test]
async fn test_start_with_oversized_limits_is_ignored() {
    let node = start_node(&[]).await;
    let (bits_file, sha1) = node.write_droplet("blog");
    let subject = format!("dea.{}.start", node.config.node_id);

    node.publish(&subject, start_request("blog", 0, u64::MAX, &bits_file, &sha1));
    let mut request = start_request("blog", 1, MEM, &bits_file, &sha1);
    request["limits"]["disk"] = serde_json::json!(u64::MAX);
    node.publish(&subject, request);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(node.agent.droplets().is_empty());
    assert_eq!(node.agent.monitor().reserved_memory_mb(), 0);
    assert_eq!(node.agent.monitor().clients(), 0);

    // The node keeps serving normal requests.
    let reply = node
        .bus
        .request(
            "dea.discover",
            Bytes::from(
                serde_json::json!({ "droplet": "blog", "runtime": "sh", "limits": { "mem": u64::MAX } })
                    .to_string(),
            ),
            Duration::from_millis(300),
        )
        .await;
    assert!(reply.is_err());
    node.start_running("blog", 2, MEM).await;
    assert_eq!(node.agent.monitor().reserved_memory_mb(), MEM);
}

#[tokio::test]
async fn test_start_keeps_files_inside_base_dir() {
    let node = start_node(&[]).await;
    let (bits_file, sha1) = node.write_droplet("blog");
    let subject = format!("dea.{}.start", node.config.node_id);

    // A digest that is really a relative path is refused.
    let mut request = start_request("blog", 0, MEM, &bits_file, &sha1);
    request["sha1"] = "../../escaped".into();
    node.publish(&subject, request);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node.agent.droplets().is_empty());
    assert!(!node.dir.path().join("escaped.tgz").exists());
    assert!(!node.dir.path().join("escaped.pending").exists());

    // A name with separators still lands directly under apps/.
    let mut request = start_request("blog", 1, MEM, &bits_file, &sha1);
    request["name"] = "../../outside".into();
    node.publish(&subject, request);

    let droplets = node.agent.droplets().clone();
    let running = wait_until(Duration::from_secs(5), || {
        droplets
            .instances()
            .first()
            .is_some_and(|i| i.state() == InstanceState::Running)
    })
    .await;
    assert!(running);

    let dir = droplets.instances()[0].read().properties.dir.clone();
    assert_eq!(dir.parent(), Some(node.config.apps_dir().as_path()));
    assert!(dir.join("startup").is_file());
    let escaped = std::fs::read_dir(node.dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .any(|e| e.file_name().to_string_lossy().starts_with("outside"));
    assert!(!escaped);
}

#[tokio::test]
async fn test_start_with_unreachable_bits_crashes_instance() {
    let node = start_node(&[]).await;
    let mut exits = node.bus.subscribe("droplet.exited").unwrap();
    let (bits_file, sha1) = node.write_droplet("blog");
    let subject = format!("dea.{}.start", node.config.node_id);

    // No shared copy and nothing listening at the download uri
    node.publish(
        &subject,
        start_request("blog", 0, MEM, &bits_file.with_extension("missing"), &sha1),
    );

    let exited = next_json(&mut exits).await;
    assert_eq!(exited["droplet"], "blog");
    assert_eq!(exited["reason"], "CRASHED");

    let droplets = node.agent.droplets().clone();
    let settled = wait_until(Duration::from_secs(2), || {
        droplets.instances()[0].state() == InstanceState::Crashed
            && node.agent.monitor().reserved_memory_mb() == 0
    })
    .await;
    assert!(settled);
    assert!(node.launcher.launches().is_empty());
}

#[tokio::test]
async fn test_dea_stop_publishes_exit_and_releases_resources() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    node.start_running("blog", 1, MEM).await;
    assert_eq!(node.agent.monitor().reserved_memory_mb(), 2 * MEM);

    let mut exits = node.bus.subscribe("droplet.exited").unwrap();
    let mut unregisters = node.bus.subscribe("router.unregister").unwrap();

    node.publish("dea.stop", serde_json::json!({ "droplet": "blog", "indices": [1] }));

    let exited = next_json(&mut exits).await;
    assert_eq!(exited["index"], 1);
    assert_eq!(exited["reason"], "STOPPED");
    let unregister = next_json(&mut unregisters).await;
    assert_eq!(unregister["uris"], serde_json::json!(["blog.example.com"]));

    let droplets = node.agent.droplets().clone();
    let monitor_released = wait_until(Duration::from_secs(2), || {
        node.agent.monitor().reserved_memory_mb() == MEM
    })
    .await;
    assert!(monitor_released);
    assert_eq!(node.launcher.alive_count(), 1);

    let stopped = droplets
        .instances()
        .into_iter()
        .find(|i| i.read().properties.instance_index == 1)
        .unwrap();
    assert_eq!(stopped.state(), InstanceState::Stopped);
    let dir = stopped.read().properties.dir.clone();
    assert!(dir.is_dir());

    // A stopped, notified instance is reaped on the next pass.
    node.agent.reap_crashes(Duration::from_secs(3600)).await;
    assert_eq!(droplets.instance_count(), 1);
    assert!(!dir.exists());
    assert!(!droplets.has_empty_droplet());
}

#[tokio::test]
async fn test_crash_is_detected_and_kept_for_find() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    let mut exits = node.bus.subscribe("droplet.exited").unwrap();
    let mut unregisters = node.bus.subscribe("router.unregister").unwrap();

    let instance = node.agent.droplets().instances()[0].clone();
    let pid = instance.read().properties.pid.unwrap();
    node.launcher.kill(pid);

    node.agent.monitor_apps().await;

    assert_eq!(instance.state(), InstanceState::Crashed);
    let exited = next_json(&mut exits).await;
    assert_eq!(exited["reason"], "CRASHED");
    assert!(exited["crash_timestamp"].is_i64());
    next_json(&mut unregisters).await;
    assert_eq!(node.agent.monitor().reserved_memory_mb(), 0);

    // Still findable within the retention window
    node.agent.reap_crashes(Duration::from_secs(3600)).await;
    let found = node
        .request("dea.find.droplet", serde_json::json!({ "droplet": "blog" }))
        .await;
    assert_eq!(found["state"], "CRASHED");

    // A stop on a crashed instance deletes it
    node.publish("dea.stop", serde_json::json!({ "droplet": "blog" }));
    let deleted = wait_until(Duration::from_secs(2), || {
        instance.state() == InstanceState::Deleted
    })
    .await;
    assert!(deleted);

    node.agent.reap_crashes(Duration::from_secs(3600)).await;
    assert!(node.agent.droplets().is_empty());
}

#[tokio::test]
async fn test_find_droplet_reports_stats() {
    let node = start_node(&[
        ("DEA_FILER_PORT", "9090"),
        ("DEA_FILER_USER", "filer"),
        ("DEA_FILER_PASSWORD", "secret"),
    ])
    .await;
    node.start_running("blog", 0, MEM).await;

    let found = node
        .request(
            "dea.find.droplet",
            serde_json::json!({ "droplet": "blog", "states": ["RUNNING"], "include_stats": true }),
        )
        .await;

    assert_eq!(found["dea"], node.config.node_id.to_string());
    assert_eq!(found["droplet"], "blog");
    assert_eq!(found["state"], "RUNNING");
    assert_eq!(found["file_uri"], "http://127.0.0.1:9090/droplets/");
    assert_eq!(found["credentials"], serde_json::json!(["filer", "secret"]));
    assert!(found["staged"].as_str().unwrap().starts_with("app-blog-0-"));
    assert_eq!(found["stats"]["name"], "app-blog");
    assert_eq!(found["stats"]["mem_quota"], MEM * 1024 * 1024);
}

#[tokio::test]
async fn test_find_droplet_with_no_match_is_silent() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;

    let reply = node
        .bus
        .request(
            "dea.find.droplet",
            Bytes::from(serde_json::json!({ "droplet": "blog", "states": ["CRASHED"] }).to_string()),
            Duration::from_millis(200),
        )
        .await;
    assert!(reply.is_err());
}

#[tokio::test]
async fn test_discover_answers_with_hello() {
    let node = start_node(&[]).await;

    let hello = node
        .request(
            "dea.discover",
            serde_json::json!({ "droplet": "blog", "name": "blog", "runtime": "sh", "limits": { "mem": 64 } }),
        )
        .await;
    assert_eq!(hello["id"], node.config.node_id.to_string());
    assert_eq!(hello["ip"], "127.0.0.1");
    assert_eq!(hello["port"], 12345);
}

#[tokio::test]
async fn test_discover_ignores_unsupported_runtime_and_full_node() {
    let node = start_node(&[("DEA_MAX_MEMORY_MB", "100")]).await;

    for request in [
        serde_json::json!({ "droplet": "blog", "runtime": "cobol", "limits": { "mem": 64 } }),
        serde_json::json!({ "droplet": "blog", "runtime": "sh", "limits": { "mem": 512 } }),
    ] {
        let reply = node
            .bus
            .request(
                "dea.discover",
                Bytes::from(request.to_string()),
                Duration::from_millis(300),
            )
            .await;
        assert!(reply.is_err(), "unexpected reply to {request}");
    }
}

#[tokio::test]
async fn test_dea_status_reports_accounting() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;

    let status = node.request("dea.status", serde_json::json!({})).await;
    assert_eq!(status["id"], node.config.node_id.to_string());
    assert_eq!(status["max_memory"], 1024);
    assert_eq!(status["reserved_memory"], MEM);
    assert_eq!(status["num_clients"], 1);
    assert!(status.get("state").is_none() || status["state"].is_null());
}

#[tokio::test]
async fn test_droplet_status_replies_per_instance() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    node.start_running("wiki", 0, MEM).await;

    let mut replies = node.bus.subscribe("_INBOX.status").unwrap();
    node.bus
        .publish("droplet.status", Some("_INBOX.status"), Bytes::from_static(b"{}"))
        .unwrap();

    let mut names = vec![
        next_json(&mut replies).await["name"].as_str().unwrap().to_string(),
        next_json(&mut replies).await["name"].as_str().unwrap().to_string(),
    ];
    names.sort();
    assert_eq!(names, ["app-blog", "app-wiki"]);
}

#[tokio::test]
async fn test_dea_update_swaps_routes() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    let mut registers = node.bus.subscribe("router.register").unwrap();
    let mut unregisters = node.bus.subscribe("router.unregister").unwrap();

    node.publish(
        "dea.update",
        serde_json::json!({ "droplet": "blog", "uris": ["blog.example.org"] }),
    );

    let removed = next_json(&mut unregisters).await;
    assert_eq!(removed["uris"], serde_json::json!(["blog.example.com"]));
    let added = next_json(&mut registers).await;
    assert_eq!(added["uris"], serde_json::json!(["blog.example.org"]));

    let instance = &node.agent.droplets().instances()[0];
    assert_eq!(instance.read().properties.uris, ["blog.example.org"]);
}

#[tokio::test]
async fn test_router_start_reregisters_running_instances() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    let mut registers = node.bus.subscribe("router.register").unwrap();

    node.publish("router.start", serde_json::json!({}));

    let route = next_json(&mut registers).await;
    assert_eq!(route["uris"], serde_json::json!(["blog.example.com"]));
}

#[tokio::test]
async fn test_healthmanager_start_triggers_heartbeat() {
    let node = start_node(&[]).await;
    let mut heartbeats = node.bus.subscribe("dea.heartbeat").unwrap();

    node.publish("healthmanager.start", serde_json::json!({}));

    let heartbeat = next_json(&mut heartbeats).await;
    assert_eq!(heartbeat["droplets"], serde_json::json!([]));
}

#[tokio::test]
async fn test_component_discover_replies_with_announcement() {
    let node = start_node(&[]).await;

    let component = node
        .request("vcap.component.discover", serde_json::json!({}))
        .await;
    assert_eq!(component["type"], "DEA");
    assert_eq!(component["uuid"], node.config.node_id.to_string());
    assert!(component["uptime"].as_str().unwrap().ends_with('s'));
}

#[tokio::test]
async fn test_evacuate_notifies_then_shuts_down() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    node.start_running("blog", 1, MEM).await;
    let mut exits = node.bus.subscribe("droplet.exited").unwrap();

    node.agent.evacuate().await;

    for _ in 0..2 {
        let exited = next_json(&mut exits).await;
        assert_eq!(exited["reason"], "DEA_EVACUATION");
    }
    assert_eq!(node.agent.state(), AgentState::Stopped);
    assert_eq!(node.launcher.alive_count(), 0);
    assert!(node.agent.droplets().no_monitorable_apps());

    let snapshot: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&node.config.snapshot_file).unwrap()).unwrap();
    let instances = snapshot.as_array().unwrap();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i["evacuated"] == true));
}

#[tokio::test]
async fn test_shutdown_stops_instances_and_refuses_work() {
    let node = start_node(&[]).await;
    node.start_running("blog", 0, MEM).await;
    let mut exits = node.bus.subscribe("droplet.exited").unwrap();

    node.agent.shutdown().await;

    let exited = next_json(&mut exits).await;
    assert_eq!(exited["reason"], "DEA_SHUTDOWN");
    assert_eq!(node.agent.state(), AgentState::Stopped);
    assert_eq!(node.launcher.alive_count(), 0);

    // A second shutdown is a no-op
    node.agent.shutdown().await;
    assert_eq!(node.agent.state(), AgentState::Stopped);

    // Subscriptions are gone once stopped
    let reply = node
        .bus
        .request("dea.status", Bytes::from_static(b"{}"), Duration::from_millis(200))
        .await;
    assert!(reply.is_err());
}

#[tokio::test]
async fn test_restart_recovers_snapshot() {
    let first = start_node(&[]).await;
    first.start_running("blog", 0, MEM).await;
    first.agent.droplets().snapshot_app_state().unwrap();

    let apps_dir = first.config.apps_dir();
    std::fs::create_dir_all(apps_dir.join("stray-dir")).unwrap();

    // Same directories, fresh process table: the recovered pid is gone.
    let second = harness::build_node(tempfile::TempDir::new().unwrap(), first.config.clone());
    second.agent.start().await.unwrap();

    let droplets = second.agent.droplets();
    assert_eq!(droplets.instance_count(), 1);
    let instance = droplets.instances()[0].clone();
    {
        let data = instance.read();
        assert!(data.properties.orphaned);
        assert!(data.properties.resources_tracked);
        assert_eq!(data.properties.state, InstanceState::Running);
        assert!(data.properties.dir.is_dir());
    }
    assert_eq!(second.agent.monitor().reserved_memory_mb(), MEM);
    assert!(!apps_dir.join("stray-dir").exists());

    second.agent.monitor_apps().await;
    assert_eq!(instance.state(), InstanceState::Crashed);
    assert_eq!(second.agent.monitor().reserved_memory_mb(), 0);
}
