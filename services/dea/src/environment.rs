//! Process environment for a launched instance.

use std::collections::BTreeMap;

use dea_messages::ServiceBinding;
use serde_json::{json, Value};
use tracing::warn;

use crate::droplet::DropletInstanceProperties;
use crate::runtimes::RuntimeRegistry;

/// Build the environment an instance is launched with.
///
/// Order matters: later entries win when the launcher applies them, so
/// user-supplied `KEY=VALUE` pairs come last.
pub fn build_environment(
    props: &DropletInstanceProperties,
    runtimes: &RuntimeRegistry,
    host: &str,
    app_env: &[String],
    services: &[ServiceBinding],
) -> Vec<(String, String)> {
    let mut env = vec![
        ("HOME".to_string(), props.dir.to_string_lossy().into_owned()),
        (
            "VCAP_APPLICATION".to_string(),
            vcap_application(props, host).to_string(),
        ),
        (
            "VCAP_SERVICES".to_string(),
            vcap_services(services).to_string(),
        ),
        ("VCAP_APP_HOST".to_string(), host.to_string()),
    ];

    if let Some(port) = props.port {
        env.push(("VCAP_APP_PORT".to_string(), port.to_string()));
    }
    if let Some(ip) = &props.debug_ip {
        env.push(("VCAP_DEBUG_IP".to_string(), ip.clone()));
    }
    if let Some(port) = props.debug_port {
        env.push(("VCAP_DEBUG_PORT".to_string(), port.to_string()));
    }

    env.extend(runtimes.environment_for(&props.runtime, props.debug_mode.as_deref()));

    for entry in app_env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.push((key.to_string(), value.to_string()));
            }
            _ => warn!(
                instance_id = %props.instance_id,
                entry = %entry,
                "Ignoring malformed environment entry"
            ),
        }
    }

    env
}

fn vcap_application(props: &DropletInstanceProperties, host: &str) -> Value {
    json!({
        "instance_id": props.instance_id.to_string(),
        "instance_index": props.instance_index,
        "name": props.name,
        "uris": props.uris,
        "users": props.users,
        "version": props.version,
        "start": props.start.to_rfc3339(),
        "runtime": props.runtime,
        "state_timestamp": props.state_timestamp.timestamp(),
        "port": props.port,
        "host": host,
        "limits": {
            "fds": props.fds_quota,
            "mem": props.mem_quota_bytes,
            "disk": props.disk_quota_bytes,
        },
    })
}

/// Services grouped by label, keeping only the fields applications see.
fn vcap_services(services: &[ServiceBinding]) -> Value {
    let mut by_label: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for service in services {
        let label = service.label.clone().unwrap_or_default();
        by_label.entry(label).or_default().push(json!({
            "name": service.name,
            "label": service.label,
            "plan": service.plan,
            "tags": service.tags,
            "plan_option": service.plan_option,
            "credentials": service.credentials,
        }));
    }
    json!(by_label)
}
