//! Bus subject names.

pub const DEA_STATUS: &str = "dea.status";
pub const DROPLET_STATUS: &str = "droplet.status";
pub const DEA_DISCOVER: &str = "dea.discover";
pub const DEA_FIND_DROPLET: &str = "dea.find.droplet";
pub const DEA_UPDATE: &str = "dea.update";
pub const DEA_STOP: &str = "dea.stop";
pub const ROUTER_START: &str = "router.start";
pub const HEALTHMANAGER_START: &str = "healthmanager.start";
pub const COMPONENT_DISCOVER: &str = "vcap.component.discover";

pub const DEA_HEARTBEAT: &str = "dea.heartbeat";
pub const DEA_START: &str = "dea.start";
pub const DROPLET_EXITED: &str = "droplet.exited";
pub const ROUTER_REGISTER: &str = "router.register";
pub const ROUTER_UNREGISTER: &str = "router.unregister";
pub const COMPONENT_ANNOUNCE: &str = "vcap.component.announce";

/// Subject addressed uniquely to one node: `dea.<node-id>.start`.
pub fn dea_instance_start(node_id: &impl std::fmt::Display) -> String {
    format!("dea.{node_id}.start")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dea_id::NodeId;

    #[test]
    fn test_dea_instance_start_subject() {
        let id = NodeId::new();
        let subject = dea_instance_start(&id);
        assert_eq!(subject, format!("dea.{id}.start"));
        assert!(subject.starts_with("dea.dea_"));
    }
}
