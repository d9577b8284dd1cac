use std::{
    path::Path,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use tracing::{debug, warn};

use crate::http::{CONTROL_TIMEOUT, HttpClient};

/// Externally observable instance lifecycle phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    Stopped,
    Exited,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Running => "Running",
            Phase::Stopped => "Stopped",
            Phase::Exited => "Exited",
            Phase::Failed => "Failed",
        }
    }
}

/// One service endpoint derived from a `service=` line in `meta.ini`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub protocol: String,
    pub port: u16,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeHeartbeatBody<'a> {
    node_id: &'a str,
    ip: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceStatusBody<'a> {
    instance_id: &'a str,
    phase: &'a str,
    exit_code: i32,
    healthy: bool,
    ts_unix: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceRegisterBody<'a> {
    instance_id: &'a str,
    node_id: &'a str,
    ip: &'a str,
    endpoints: &'a [ServiceEndpoint],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceHeartbeatBody<'a> {
    instance_id: &'a str,
}

/// Best-effort reporting of lifecycle transitions and service endpoints.
/// Delivery failures are logged and dropped; the controller's own reconcile
/// loop catches up on the next heartbeat.
#[derive(Clone)]
pub struct StatusReporter {
    http: Arc<HttpClient>,
    controller: String,
    node_id: String,
    node_ip: String,
}

impl StatusReporter {
    pub fn new(http: Arc<HttpClient>, controller: String, node_id: String, node_ip: String) -> Self {
        Self {
            http,
            controller,
            node_id,
            node_ip,
        }
    }

    pub async fn heartbeat_node(&self) {
        let url = format!("{}/v1/nodes/heartbeat", self.controller);
        let body = NodeHeartbeatBody {
            node_id: &self.node_id,
            ip: &self.node_ip,
        };
        let resp = self.http.post_json(&url, &body, CONTROL_TIMEOUT).await;
        if !resp.is_ok() {
            warn!(status = resp.status, "node heartbeat failed");
        }
    }

    pub async fn report_instance(
        &self,
        instance_id: &str,
        phase: Phase,
        exit_code: i32,
        healthy: bool,
    ) {
        let ts_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        let url = format!("{}/v1/instances/status", self.controller);
        let body = InstanceStatusBody {
            instance_id,
            phase: phase.as_str(),
            exit_code,
            healthy,
            ts_unix,
        };
        let resp = self.http.post_json(&url, &body, CONTROL_TIMEOUT).await;
        if !resp.is_ok() {
            warn!(
                instance_id,
                phase = phase.as_str(),
                status = resp.status,
                "failed to post instance status"
            );
        }
    }

    pub async fn register_services(&self, instance_id: &str, endpoints: &[ServiceEndpoint]) {
        if endpoints.is_empty() {
            return;
        }
        let url = format!("{}/v1/services/register", self.controller);
        let body = ServiceRegisterBody {
            instance_id,
            node_id: &self.node_id,
            ip: &self.node_ip,
            endpoints,
        };
        let resp = self.http.post_json(&url, &body, CONTROL_TIMEOUT).await;
        if !resp.is_ok() {
            warn!(instance_id, status = resp.status, "failed to register services");
        } else {
            debug!(instance_id, count = endpoints.len(), "registered service endpoints");
        }
    }

    pub async fn heartbeat_service(&self, instance_id: &str) {
        let url = format!("{}/v1/services/heartbeat", self.controller);
        let body = ServiceHeartbeatBody { instance_id };
        let resp = self.http.post_json(&url, &body, CONTROL_TIMEOUT).await;
        if !resp.is_ok() {
            warn!(instance_id, status = resp.status, "service heartbeat failed");
        }
    }

    pub async fn delete_services(&self, instance_id: &str) {
        let url = format!("{}/v1/services?instanceId={instance_id}", self.controller);
        let resp = self.http.delete(&url, CONTROL_TIMEOUT).await;
        if !resp.is_ok() {
            warn!(instance_id, status = resp.status, "failed to delete services");
        }
    }
}

/// Parse `service=<name>:<protocol>:<port>` lines. Blank lines, comments,
/// and malformed entries are skipped silently; other keys are reserved.
pub fn parse_meta_ini(content: &str) -> Vec<ServiceEndpoint> {
    let mut endpoints = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let Some(value) = line.strip_prefix("service=") else {
            continue;
        };
        let mut parts = value.splitn(3, ':');
        let (Some(name), Some(protocol), Some(port)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let Ok(port) = port.trim().parse::<u16>() else {
            continue;
        };
        if name.is_empty() || port == 0 {
            continue;
        }
        endpoints.push(ServiceEndpoint {
            service_name: name.to_string(),
            protocol: protocol.to_string(),
            port,
        });
    }
    endpoints
}

/// Read `<app_dir>/meta.ini` if present and parse its service lines.
pub fn load_service_endpoints(app_dir: &Path) -> Vec<ServiceEndpoint> {
    match std::fs::read_to_string(app_dir.join("meta.ini")) {
        Ok(content) => parse_meta_ini(&content),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_lines() {
        let content = "service=echo:http:8000\nservice=metrics:grpc:9100\n";
        assert_eq!(
            parse_meta_ini(content),
            vec![
                ServiceEndpoint {
                    service_name: "echo".into(),
                    protocol: "http".into(),
                    port: 8000,
                },
                ServiceEndpoint {
                    service_name: "metrics".into(),
                    protocol: "grpc".into(),
                    port: 9100,
                },
            ]
        );
    }

    #[test]
    fn skips_blank_comment_and_unknown_lines() {
        let content = "\n# comment\n; also comment\nname=demo\nversion=1.2\nservice=api:http:8080\n";
        let endpoints = parse_meta_ini(content);
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].service_name, "api");
    }

    #[test]
    fn skips_malformed_service_lines() {
        let content = "service=\nservice=noport:http\nservice=bad:http:notanumber\nservice=zero:http:0\nservice=:http:80\n";
        assert!(parse_meta_ini(content).is_empty());
    }

    #[test]
    fn trailing_whitespace_on_port_is_tolerated() {
        let endpoints = parse_meta_ini("service=echo:tcp:7000 \n");
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].port, 7000);
    }

    #[test]
    fn status_body_uses_wire_field_names() {
        let body = InstanceStatusBody {
            instance_id: "i1",
            phase: Phase::Failed.as_str(),
            exit_code: 3,
            healthy: false,
            ts_unix: 1700000000,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["instanceId"], "i1");
        assert_eq!(json["phase"], "Failed");
        assert_eq!(json["exitCode"], 3);
        assert_eq!(json["healthy"], false);
        assert_eq!(json["tsUnix"], 1700000000);
    }

    #[test]
    fn register_body_nests_endpoints() {
        let endpoints = vec![ServiceEndpoint {
            service_name: "echo".into(),
            protocol: "http".into(),
            port: 8000,
        }];
        let body = ServiceRegisterBody {
            instance_id: "i1",
            node_id: "nodeA",
            ip: "127.0.0.1",
            endpoints: &endpoints,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["endpoints"][0]["serviceName"], "echo");
        assert_eq!(json["endpoints"][0]["protocol"], "http");
        assert_eq!(json["endpoints"][0]["port"], 8000);
    }
}
