use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Agent configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Identity reported to the controller.
    pub node_id: String,
    /// Controller base URL, no trailing slash.
    pub controller_base: String,
    /// Root of on-disk instance state; per-node storage lives underneath.
    pub data_dir: PathBuf,
    /// Address reported for this node and its service endpoints.
    pub node_ip: String,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            node_id: env_or("AGENT_NODE_ID", "nodeA"),
            controller_base: env_or("CONTROLLER_BASE", "http://127.0.0.1:8080")
                .trim_end_matches('/')
                .to_string(),
            data_dir: PathBuf::from(env_or("AGENT_DATA_DIR", "/tmp/plum-agent")),
            node_ip: "127.0.0.1".to_string(),
        }
    }

    /// `<data_dir>/<node_id>`, the root for this node's instance directories.
    pub fn node_dir(&self) -> PathBuf {
        self.data_dir.join(&self.node_id)
    }

    /// Controller gRPC endpoint injected into children for the task-stream
    /// runtime: same host as the HTTP base, fixed port 9090.
    pub fn controller_grpc_addr(&self) -> String {
        match reqwest::Url::parse(&self.controller_base) {
            Ok(url) => match url.host_str() {
                Some(host) => format!("{host}:9090"),
                None => "127.0.0.1:9090".to_string(),
            },
            Err(_) => "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grpc_addr_follows_controller_host() {
        let cfg = AgentConfig {
            node_id: "nodeA".into(),
            controller_base: "http://controller.local:8080".into(),
            data_dir: PathBuf::from("/tmp/plum-agent"),
            node_ip: "127.0.0.1".into(),
        };
        assert_eq!(cfg.controller_grpc_addr(), "controller.local:9090");
    }

    #[test]
    fn grpc_addr_falls_back_on_unparsable_base() {
        let cfg = AgentConfig {
            node_id: "nodeA".into(),
            controller_base: "not a url".into(),
            data_dir: PathBuf::from("/tmp/plum-agent"),
            node_ip: "127.0.0.1".into(),
        };
        assert_eq!(cfg.controller_grpc_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn node_dir_nests_node_under_data_dir() {
        let cfg = AgentConfig {
            node_id: "nodeB".into(),
            controller_base: "http://127.0.0.1:8080".into(),
            data_dir: PathBuf::from("/var/lib/plum"),
            node_ip: "127.0.0.1".into(),
        };
        assert_eq!(cfg.node_dir(), PathBuf::from("/var/lib/plum/nodeB"));
    }
}
