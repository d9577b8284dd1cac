use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::future::BoxFuture;
use plum_proto::task_v1::{
    Heartbeat, TaskAck, TaskRequest, TaskResponse, WorkerRegister, task_ack::Msg,
    task_service_client::TaskServiceClient,
};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::Endpoint;
use tracing::{debug, info, warn};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// One inbound task, as handed to a registered handler.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: String,
    pub name: String,
    pub payload: String,
}

/// A registered task handler. The returned string is sent back verbatim as
/// the task result; an error becomes the result's error text.
pub type TaskHandler = Arc<dyn Fn(TaskInvocation) -> BoxFuture<'static, anyhow::Result<String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct StreamWorkerOptions {
    pub worker_id: String,
    pub node_id: String,
    pub instance_id: String,
    pub app_name: String,
    pub app_version: String,
    pub controller_grpc_addr: String,
    /// Task names declared at registration. `register_task` appends to this
    /// automatically; listing extra names here is allowed but pointless.
    pub tasks: Vec<String>,
    pub labels: HashMap<String, String>,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub auto_reconnect: bool,
}

impl Default for StreamWorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: String::new(),
            node_id: "nodeA".to_string(),
            instance_id: String::new(),
            app_name: String::new(),
            app_version: "1.0.0".to_string(),
            controller_grpc_addr: "127.0.0.1:9090".to_string(),
            tasks: Vec::new(),
            labels: HashMap::new(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            auto_reconnect: true,
        }
    }
}

impl StreamWorkerOptions {
    /// Fill unset fields from the environment the agent injects into every
    /// child it spawns (plus `WORKER_ID`, which the application provides).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: env_or("WORKER_ID", ""),
            node_id: env_or("WORKER_NODE_ID", &defaults.node_id),
            instance_id: env_or("PLUM_INSTANCE_ID", ""),
            app_name: env_or("PLUM_APP_NAME", ""),
            app_version: env_or("PLUM_APP_VERSION", &defaults.app_version),
            controller_grpc_addr: env_or("CONTROLLER_GRPC_ADDR", &defaults.controller_grpc_addr),
            ..defaults
        }
    }
}

/// Task-stream worker runtime.
///
/// Holds the handler registry and drives the connect/register/dispatch loop.
/// `stop()` may be called from any task; the reader notices it within one
/// read cycle.
pub struct StreamWorker {
    options: StreamWorkerOptions,
    handlers: HashMap<String, TaskHandler>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl StreamWorker {
    pub fn new(options: StreamWorkerOptions) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            options,
            handlers: HashMap::new(),
            stop_tx,
            stop_rx,
        }
    }

    pub fn from_env() -> Self {
        Self::new(StreamWorkerOptions::from_env())
    }

    pub fn options(&self) -> &StreamWorkerOptions {
        &self.options
    }

    /// Register a handler for `name` and declare the task to the controller.
    pub fn register_task<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let name = name.into();
        let handler: TaskHandler = Arc::new(move |inv| Box::pin(handler(inv)));
        self.handlers.insert(name.clone(), handler);
        if !self.options.tasks.contains(&name) {
            self.options.tasks.push(name);
        }
    }

    /// Request shutdown. The stream loop exits at its next read cycle and
    /// `run` returns without reconnecting.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Connect and serve tasks until `stop()` is called. With auto-reconnect
    /// enabled, stream failures sleep `reconnect_interval` and start over
    /// from registration; the handler set is preserved.
    pub async fn run(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.handlers.is_empty(), "no tasks registered");
        anyhow::ensure!(
            !self.options.worker_id.is_empty(),
            "worker_id is required (set WORKER_ID)"
        );

        info!(
            worker_id = %self.options.worker_id,
            node_id = %self.options.node_id,
            instance_id = %self.options.instance_id,
            controller = %self.options.controller_grpc_addr,
            tasks = ?self.options.tasks,
            "starting stream worker"
        );

        let handlers = Arc::new(self.handlers.clone());
        let mut stop = self.stop_rx.clone();

        loop {
            if *stop.borrow() {
                return Ok(());
            }

            match self.run_stream(handlers.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(error = %e, "task stream disconnected"),
            }

            if !self.options.auto_reconnect || *stop.borrow() {
                return Ok(());
            }

            info!(
                seconds = self.options.reconnect_interval.as_secs(),
                "reconnecting to controller"
            );
            tokio::select! {
                _ = tokio::time::sleep(self.options.reconnect_interval) => {}
                _ = stop.changed() => {}
            }
        }
    }

    /// One stream lifetime: register, heartbeat, dispatch until the stream
    /// breaks (Err) or stop is requested (Ok).
    async fn run_stream(&self, handlers: Arc<HashMap<String, TaskHandler>>) -> anyhow::Result<()> {
        let endpoint = endpoint_url(&self.options.controller_grpc_addr);
        let channel = Endpoint::from_shared(endpoint.clone())
            .with_context(|| format!("invalid controller endpoint: {endpoint}"))?
            .connect()
            .await
            .with_context(|| format!("connect to controller: {endpoint}"))?;
        let mut client = TaskServiceClient::new(channel);

        // All writers (registration, heartbeats, task results) share this
        // channel; the transport consumes it sequentially, so frames from
        // concurrent tasks never interleave on the wire.
        let (tx, rx) = mpsc::channel::<TaskAck>(32);
        let mut inbound = client
            .task_stream(ReceiverStream::new(rx))
            .await
            .context("open task stream")?
            .into_inner();

        tx.send(self.register_ack())
            .await
            .map_err(|_| anyhow::anyhow!("stream closed before registration"))?;
        info!("connected to controller and registered");

        let heartbeat = self.spawn_heartbeat(tx.clone());

        let mut stop = self.stop_rx.clone();
        let result = loop {
            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break Ok(());
                    }
                }
                msg = inbound.message() => match msg {
                    Ok(Some(task)) => dispatch(handlers.clone(), task, tx.clone()),
                    Ok(None) => break Err(anyhow::anyhow!("stream closed by controller")),
                    Err(status) => break Err(anyhow::anyhow!("stream read failed: {status}")),
                }
            }
        };

        heartbeat.abort();
        result
    }

    fn spawn_heartbeat(&self, tx: mpsc::Sender<TaskAck>) -> tokio::task::JoinHandle<()> {
        let worker_id = self.options.worker_id.clone();
        let interval = self.options.heartbeat_interval;
        let mut stop = self.stop_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.changed() => {}
                }
                if *stop.borrow() {
                    return;
                }
                let ack = TaskAck {
                    msg: Some(Msg::Heartbeat(Heartbeat {
                        worker_id: worker_id.clone(),
                    })),
                };
                if tx.send(ack).await.is_err() {
                    return;
                }
                debug!("heartbeat sent");
            }
        })
    }

    fn register_ack(&self) -> TaskAck {
        TaskAck {
            msg: Some(Msg::Register(WorkerRegister {
                worker_id: self.options.worker_id.clone(),
                node_id: self.options.node_id.clone(),
                instance_id: self.options.instance_id.clone(),
                app_name: self.options.app_name.clone(),
                app_version: self.options.app_version.clone(),
                tasks: self.options.tasks.clone(),
                labels: self.options.labels.clone(),
            })),
        }
    }
}

fn endpoint_url(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

fn dispatch(handlers: Arc<HashMap<String, TaskHandler>>, task: TaskRequest, tx: mpsc::Sender<TaskAck>) {
    tokio::spawn(async move {
        debug!(task_id = %task.task_id, name = %task.name, "task received");
        let response = execute(&handlers, task).await;
        let task_id = response.task_id.clone();
        let ack = TaskAck {
            msg: Some(Msg::Result(response)),
        };
        if tx.send(ack).await.is_err() {
            warn!(%task_id, "failed to send task result: stream gone");
        }
    });
}

/// Run one task to completion. Always yields exactly one response carrying
/// the inbound task id, whether the handler succeeded, failed, or is unknown.
async fn execute(handlers: &HashMap<String, TaskHandler>, task: TaskRequest) -> TaskResponse {
    let TaskRequest {
        task_id,
        name,
        payload,
    } = task;

    let Some(handler) = handlers.get(&name) else {
        warn!(%name, "unknown task");
        return TaskResponse {
            task_id,
            result: String::new(),
            error: format!("Unknown task: {name}"),
        };
    };

    let invocation = TaskInvocation {
        task_id: task_id.clone(),
        name,
        payload,
    };
    match handler(invocation).await {
        Ok(result) => TaskResponse {
            task_id,
            result,
            error: String::new(),
        },
        Err(e) => TaskResponse {
            task_id,
            result: String::new(),
            error: format!("Task execution error: {e}"),
        },
    }
}
