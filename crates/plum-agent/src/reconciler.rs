use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use serde::Deserialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    artifact::ArtifactStore,
    reporter::{self, Phase, StatusReporter},
    supervisor::{self, ChildHandle, SpawnEnv},
};

/// Grace period between SIGTERM and SIGKILL when stopping an instance.
const TERM_GRACE: Duration = Duration::from_secs(5);
/// Shutdown drain: up to 70 sub-intervals of 100 ms (~7 s total), enough for
/// the SIGTERM grace to elapse and the SIGKILL escalation to land.
const DRAIN_ROUNDS: u32 = 70;
const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// One desired-state record from the controller. Unknown fields are
/// ignored and every field except `instanceId` is optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AssignmentItem {
    pub instance_id: String,
    pub artifact_url: String,
    pub start_cmd: String,
    pub desired: String,
    pub app_name: String,
    pub app_version: String,
}

#[derive(Debug, Default, Deserialize)]
struct AssignmentList {
    #[serde(default)]
    items: Vec<AssignmentItem>,
}

/// Decode an assignments response body, keeping only items desired Running.
/// A malformed body degrades to an empty list; the next tick re-queries.
pub fn parse_assignments(body: &[u8]) -> Vec<AssignmentItem> {
    match serde_json::from_slice::<AssignmentList>(body) {
        Ok(list) => list
            .items
            .into_iter()
            .filter(|item| item.desired == "Running" && !item.instance_id.is_empty())
            .collect(),
        Err(e) => {
            warn!(error = %e, "malformed assignments body, treating as empty");
            Vec::new()
        }
    }
}

/// Artifact URL normalisation: absolute URLs pass through, `/relative`
/// paths append to the controller base, bare paths get a `/` separator.
pub fn normalize_artifact_url(controller: &str, raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.starts_with('/') {
        format!("{controller}{raw}")
    } else {
        format!("{controller}/{raw}")
    }
}

struct InstanceState {
    handle: ChildHandle,
    /// Set when the first termination signal is sent; escalation is keyed
    /// on this and never resets.
    stop_sent_at: Option<Instant>,
}

/// The agent's control loop core. Owns the instance map exclusively and is
/// the only mutator; one `sync` pass runs reap, stop-extras, and
/// start-missing in strict order.
pub struct Reconciler {
    node_id: String,
    controller_grpc_addr: String,
    artifacts: ArtifactStore,
    reporter: StatusReporter,
    instances: HashMap<String, InstanceState>,
}

impl Reconciler {
    pub fn new(
        node_id: String,
        controller_grpc_addr: String,
        artifacts: ArtifactStore,
        reporter: StatusReporter,
    ) -> Self {
        Self {
            node_id,
            controller_grpc_addr,
            artifacts,
            reporter,
            instances: HashMap::new(),
        }
    }

    /// One reconcile pass against the desired set.
    pub async fn sync(&mut self, items: &[AssignmentItem]) {
        let keep: HashSet<&str> = items.iter().map(|i| i.instance_id.as_str()).collect();
        self.reap_exited().await;
        self.stop_extras(&keep).await;
        for item in items {
            self.ensure_running(item).await;
        }
    }

    /// Register and heartbeat service endpoints for every desired instance.
    /// Runs after the desired set is applied so a just-started instance is
    /// registered in the same tick.
    pub async fn refresh_services(&self, items: &[AssignmentItem]) {
        for item in items {
            let endpoints = reporter::load_service_endpoints(&self.artifacts.app_dir(&item.instance_id));
            self.reporter
                .register_services(&item.instance_id, &endpoints)
                .await;
            self.reporter.heartbeat_service(&item.instance_id).await;
        }
    }

    /// Phase 1: non-blockingly reap children that exited on their own,
    /// classify them, report the terminal phase, and drop their state.
    async fn reap_exited(&mut self) {
        let exited: Vec<String> = self
            .instances
            .iter_mut()
            .filter_map(|(id, state)| state.handle.try_reap().map(|_| id.clone()))
            .collect();

        for id in exited {
            if let Some(state) = self.instances.remove(&id) {
                self.report_reaped(&id, state).await;
            }
        }
    }

    async fn report_reaped(&self, instance_id: &str, mut state: InstanceState) {
        // Operator-initiated stop wins over an incidental exit code.
        if state.stop_sent_at.is_some() {
            info!(instance_id, "instance stopped");
            self.reporter
                .report_instance(instance_id, Phase::Stopped, 0, true)
                .await;
        } else {
            let code = state.handle.try_reap().and_then(|s| s.code()).unwrap_or(-1);
            let healthy = code == 0;
            let phase = if healthy { Phase::Exited } else { Phase::Failed };
            info!(instance_id, code, phase = phase.as_str(), "instance exited");
            self.reporter
                .report_instance(instance_id, phase, code, healthy)
                .await;
        }
        self.reporter.delete_services(instance_id).await;
    }

    /// Phase 2: drive the termination state machine one step for every
    /// tracked instance missing from the desired set.
    async fn stop_extras(&mut self, keep: &HashSet<&str>) {
        let now = Instant::now();
        let extra: Vec<String> = self
            .instances
            .keys()
            .filter(|id| !keep.contains(id.as_str()))
            .cloned()
            .collect();

        for id in extra {
            let escalate = {
                let Some(state) = self.instances.get_mut(&id) else {
                    continue;
                };
                match state.stop_sent_at {
                    None => {
                        info!(instance_id = %id, pid = state.handle.pid(), "sending SIGTERM");
                        state.handle.send_term();
                        state.stop_sent_at = Some(now);
                        false
                    }
                    Some(sent) => now.duration_since(sent) >= TERM_GRACE,
                }
            };

            if escalate
                && let Some(mut state) = self.instances.remove(&id)
            {
                info!(instance_id = %id, pid = state.handle.pid(), "escalating to SIGKILL");
                state.handle.send_kill();
                state.handle.try_reap();
                state.handle.reap_in_background();
                self.reporter
                    .report_instance(&id, Phase::Stopped, 0, true)
                    .await;
                self.reporter.delete_services(&id).await;
            }
        }
    }

    /// Phase 3: materialise every desired item without a live child.
    async fn ensure_running(&mut self, item: &AssignmentItem) {
        if let Some(state) = self.instances.get_mut(&item.instance_id) {
            if state.handle.is_alive() {
                return;
            }
            // Died between the reap phase and now; classify before restarting.
            if let Some(state) = self.instances.remove(&item.instance_id) {
                self.report_reaped(&item.instance_id, state).await;
            }
        }

        let app_dir = match self
            .artifacts
            .ensure_artifact(&item.instance_id, &item.artifact_url)
            .await
        {
            Ok(dir) => dir,
            Err(e) => {
                warn!(instance_id = %item.instance_id, error = %e, "artifact not ready, retrying next tick");
                return;
            }
        };

        let env = SpawnEnv {
            instance_id: &item.instance_id,
            node_id: &self.node_id,
            controller_grpc_addr: &self.controller_grpc_addr,
            app_name: Some(item.app_name.as_str()),
            app_version: Some(item.app_version.as_str()),
        };
        let handle = match supervisor::spawn(&app_dir, &item.start_cmd, &env) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(instance_id = %item.instance_id, error = %e, "spawn failed, retrying next tick");
                return;
            }
        };

        info!(instance_id = %item.instance_id, pid = handle.pid(), "started instance");
        self.instances.insert(
            item.instance_id.clone(),
            InstanceState {
                handle,
                stop_sent_at: None,
            },
        );
        self.reporter
            .report_instance(&item.instance_id, Phase::Running, 0, true)
            .await;
    }

    /// Terminal drain on agent shutdown: run stop/reap against an empty
    /// desired set until every child is gone, escalating SIGTERM to SIGKILL
    /// on the usual schedule. Bounded at roughly seven seconds.
    pub async fn drain(&mut self) {
        let empty = HashSet::new();
        for _ in 0..DRAIN_ROUNDS {
            self.stop_extras(&empty).await;
            self.reap_exited().await;
            if self.instances.is_empty() {
                return;
            }
            tokio::time::sleep(DRAIN_INTERVAL).await;
        }
        self.stop_extras(&empty).await;
        self.reap_exited().await;
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_absolute_urls() {
        let base = "http://127.0.0.1:8080";
        assert_eq!(
            normalize_artifact_url(base, "http://mirror/app.zip"),
            "http://mirror/app.zip"
        );
        assert_eq!(
            normalize_artifact_url(base, "https://mirror/app.zip"),
            "https://mirror/app.zip"
        );
    }

    #[test]
    fn normalize_appends_rooted_paths_to_controller() {
        assert_eq!(
            normalize_artifact_url("http://127.0.0.1:8080", "/artifacts/x.zip"),
            "http://127.0.0.1:8080/artifacts/x.zip"
        );
    }

    #[test]
    fn normalize_inserts_separator_for_bare_paths() {
        assert_eq!(
            normalize_artifact_url("http://127.0.0.1:8080", "artifacts/x.zip"),
            "http://127.0.0.1:8080/artifacts/x.zip"
        );
    }

    #[test]
    fn parse_keeps_only_running_items() {
        let body = br#"{"items":[
            {"instanceId":"i1","desired":"Running","artifactUrl":"/artifacts/x.zip","startCmd":""},
            {"instanceId":"i2","desired":"Stopped","artifactUrl":"/artifacts/y.zip"},
            {"instanceId":"","desired":"Running","artifactUrl":"/artifacts/z.zip"}
        ]}"#;
        let items = parse_assignments(body);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].instance_id, "i1");
        assert_eq!(items[0].artifact_url, "/artifacts/x.zip");
        assert_eq!(items[0].start_cmd, "");
    }

    #[test]
    fn parse_tolerates_unknown_and_missing_fields() {
        let body = br#"{"items":[
            {"instanceId":"i1","desired":"Running","artifactUrl":"a.zip",
             "appName":"demo","appVersion":"1.2.0","replicas":3,"labels":{"x":"y"}}
        ]}"#;
        let items = parse_assignments(body);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].app_name, "demo");
        assert_eq!(items[0].app_version, "1.2.0");
    }

    #[test]
    fn parse_treats_malformed_body_as_empty() {
        assert!(parse_assignments(b"not json").is_empty());
        assert!(parse_assignments(b"{\"items\": 7}").is_empty());
    }

    #[test]
    fn parse_accepts_missing_items_key() {
        assert!(parse_assignments(b"{}").is_empty());
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::{http::HttpClient, reporter::StatusReporter};
        use std::sync::Arc;

        fn reconciler_with_base(base: &std::path::Path) -> Reconciler {
            let http = Arc::new(HttpClient::new());
            // Point at a closed port; reports degrade to logged warnings.
            let controller = "http://127.0.0.1:1".to_string();
            let reporter = StatusReporter::new(
                http.clone(),
                controller,
                "nodeA".to_string(),
                "127.0.0.1".to_string(),
            );
            let artifacts = ArtifactStore::new(base.to_path_buf(), http);
            Reconciler::new(
                "nodeA".to_string(),
                "127.0.0.1:9090".to_string(),
                artifacts,
                reporter,
            )
        }

        fn spawn_sleeper(rec: &mut Reconciler, instance_id: &str) {
            let env = SpawnEnv {
                instance_id,
                node_id: "nodeA",
                controller_grpc_addr: "127.0.0.1:9090",
                app_name: None,
                app_version: None,
            };
            let handle = supervisor::spawn(std::path::Path::new("/"), "sleep 30", &env).unwrap();
            rec.instances.insert(
                instance_id.to_string(),
                InstanceState {
                    handle,
                    stop_sent_at: None,
                },
            );
        }

        #[tokio::test]
        async fn reap_classifies_self_exit() {
            let dir = tempfile::tempdir().unwrap();
            let mut rec = reconciler_with_base(dir.path());

            let env = SpawnEnv {
                instance_id: "i1",
                node_id: "nodeA",
                controller_grpc_addr: "127.0.0.1:9090",
                app_name: None,
                app_version: None,
            };
            let handle = supervisor::spawn(std::path::Path::new("/"), "exit 3", &env).unwrap();
            rec.instances.insert(
                "i1".to_string(),
                InstanceState {
                    handle,
                    stop_sent_at: None,
                },
            );

            // Give the child time to exit, then reap.
            tokio::time::sleep(Duration::from_millis(300)).await;
            rec.reap_exited().await;
            assert_eq!(rec.tracked(), 0);
        }

        #[tokio::test]
        async fn stop_extras_sends_term_then_waits_for_grace() {
            let dir = tempfile::tempdir().unwrap();
            let mut rec = reconciler_with_base(dir.path());
            spawn_sleeper(&mut rec, "i1");

            let keep = HashSet::new();
            rec.stop_extras(&keep).await;
            // SIGTERM sent but grace not elapsed: still tracked.
            assert_eq!(rec.tracked(), 1);
            assert!(rec.instances.get("i1").unwrap().stop_sent_at.is_some());

            // `sleep` dies on SIGTERM; the next pass reaps it as Stopped.
            tokio::time::sleep(Duration::from_millis(300)).await;
            rec.reap_exited().await;
            assert_eq!(rec.tracked(), 0);
        }

        #[tokio::test]
        async fn drain_empties_the_instance_map() {
            let dir = tempfile::tempdir().unwrap();
            let mut rec = reconciler_with_base(dir.path());
            spawn_sleeper(&mut rec, "i1");
            spawn_sleeper(&mut rec, "i2");

            rec.drain().await;
            assert_eq!(rec.tracked(), 0);
        }
    }
}
