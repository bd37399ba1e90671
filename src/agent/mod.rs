//! Long-lived agent process (spec §4.8): registers with the controller,
//! keeps a heartbeat and a periodic fingerprint refresh going, and holds the
//! persistent event channel the controller dispatches subtasks over.

pub mod sampler;
pub mod subtasks;

use crate::config::AgentConfig;
use crate::constants::{HTTP_REQUEST_TIMEOUT_SECS, RECONNECT_BACKOFF_CAP_SECS, REGISTER_BACKOFF_CAP_SECS};
use crate::error::{CoreError, Result};
use crate::event_bus::AgentMessage;
use crate::models::{ExecutionStatus, SubtaskKind};
use futures_util::{SinkExt, StreamExt};
use sampler::{FingerprintSampler, SysinfoSampler};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

struct RunningSubtask {
    task_id: i64,
    subtask_name: String,
}

pub struct AgentRuntime {
    config: AgentConfig,
    http: reqwest::Client,
    sampler: Arc<dyn FingerprintSampler>,
    capabilities: HashSet<String>,
    /// Enforces the one-subtask-at-a-time discipline (spec §4.8): a second
    /// dispatch arriving while this is `Some` is NACK'd.
    running: Arc<Mutex<Option<RunningSubtask>>>,
}

impl AgentRuntime {
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(CoreError::from)?;
        Ok(Self {
            config,
            http,
            sampler: Arc::new(SysinfoSampler::new()),
            capabilities: SubtaskKind::ALL.iter().map(|k| k.as_str().to_string()).collect(),
            running: Arc::new(Mutex::new(None)),
        })
    }

    fn address(&self) -> String {
        local_ip().unwrap_or_else(|| "0.0.0.0".to_string())
    }

    fn websocket_url(&self) -> String {
        let base = self
            .config
            .server_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/api/agents/{}/ws", self.config.machine_name)
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.register_with_retry().await;

        let heartbeat = tokio::spawn(Self::heartbeat_loop(self.clone()));
        let config_update = tokio::spawn(Self::config_update_loop(self.clone()));
        let channel = tokio::spawn(Self::channel_loop(self.clone()));

        let _ = tokio::join!(heartbeat, config_update, channel);
        Ok(())
    }

    /// One-shot registration probe for the `status` CLI subcommand (spec
    /// §4.8.1) — does not retry or spawn the long-lived loops.
    pub async fn probe(&self) -> Result<serde_json::Value> {
        let url = format!("{}/api/agents/{}", self.config.server_url, self.config.machine_name);
        let resp = self.http.get(&url).send().await?;
        resp.json::<serde_json::Value>().await.map_err(CoreError::from)
    }

    async fn register_with_retry(&self) {
        let mut backoff = 1u64;
        loop {
            match self.register().await {
                Ok(()) => {
                    tracing::info!(agent = %self.config.machine_name, "registered with controller");
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, backoff_secs = backoff, "registration failed, retrying");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(REGISTER_BACKOFF_CAP_SECS);
                }
            }
        }
    }

    async fn register(&self) -> Result<()> {
        let body = serde_json::json!({
            "name": self.config.machine_name,
            "address": self.address(),
            "capabilities": self.capabilities,
            "fingerprint": self.sampler.sample(),
        });
        let url = format!("{}/api/agents/register", self.config.server_url);
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(CoreError::Transient(format!("register failed: {}", resp.status())));
        }
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_secs));
        loop {
            ticker.tick().await;
            let status = if self.running.lock().await.is_some() { "busy" } else { "free" };
            let body = serde_json::json!({
                "name": self.config.machine_name,
                "status": status,
                "fingerprint": self.sampler.sample(),
            });
            let url = format!("{}/api/agents/heartbeat", self.config.server_url);
            if let Err(e) = self.http.post(&url).json(&body).send().await {
                tracing::warn!(error = %e, "heartbeat failed");
            }
        }
    }

    async fn config_update_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.config_update_interval_secs));
        loop {
            ticker.tick().await;
            let body = serde_json::json!({
                "name": self.config.machine_name,
                "fingerprint": self.sampler.sample(),
            });
            let url = format!("{}/api/agents/update_config", self.config.server_url);
            if let Err(e) = self.http.post(&url).json(&body).send().await {
                tracing::warn!(error = %e, "config update failed");
            }
        }
    }

    async fn channel_loop(self: Arc<Self>) {
        let mut backoff = 1u64;
        loop {
            match self.clone().connect_and_serve().await {
                Ok(()) => tracing::info!(agent = %self.config.machine_name, "persistent channel closed cleanly"),
                Err(e) => tracing::warn!(error = %e, "persistent channel dropped"),
            }
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP_SECS);
            // Reconnect re-registers and re-joins its room (spec §4.8).
            self.register_with_retry().await;
        }
    }

    async fn connect_and_serve(self: Arc<Self>) -> Result<()> {
        let url = self.websocket_url();
        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| CoreError::Transient(format!("connect failed: {e}")))?;
        tracing::info!(agent = %self.config.machine_name, "persistent channel connected");
        let (mut sink, mut stream) = stream.split();

        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| CoreError::Transient(e.to_string()))?;
            let Message::Text(text) = message else { continue };
            let parsed: AgentMessage = serde_json::from_str(&text)?;
            match parsed {
                AgentMessage::SubtaskDispatch {
                    task_id,
                    subtask_id: _,
                    subtask_name,
                    order: _,
                    args: _,
                    kwargs: _,
                    timeout,
                } => {
                    self.clone().handle_dispatch(task_id, subtask_name, timeout).await;
                }
                AgentMessage::TaskCancelled { task_id } => {
                    self.handle_cancel(task_id).await;
                }
                AgentMessage::Ping => {
                    let pong = AgentMessage::Pong {
                        fingerprint: serde_json::to_value(self.sampler.sample())?,
                    };
                    let payload = serde_json::to_string(&pong)?;
                    sink.send(Message::Text(payload.into()))
                        .await
                        .map_err(|e| CoreError::Transient(e.to_string()))?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_dispatch(self: Arc<Self>, task_id: i64, subtask_name: String, timeout: u64) {
        {
            let slot = self.running.lock().await;
            if slot.is_some() {
                tracing::warn!(task_id, subtask_name, "dispatch received while busy, nacking");
                drop(slot);
                let _ = self
                    .report_result(task_id, &subtask_name, ExecutionStatus::Failed, None, Some("agent busy".into()), None)
                    .await;
                return;
            }
        }
        *self.running.lock().await = Some(RunningSubtask {
            task_id,
            subtask_name: subtask_name.clone(),
        });
        tokio::spawn(self.execute_subtask(task_id, subtask_name, timeout));
    }

    /// Runs the subtask under a watchdog bounded by `timeout` (spec §4.8).
    /// The built-in kinds are all effectively instantaneous, so there is no
    /// cooperative cancellation token to thread through here — a
    /// `task_cancelled` arriving mid-flight simply reports CANCELLED and
    /// clears the slot without interrupting anything in progress.
    async fn execute_subtask(self: Arc<Self>, task_id: i64, subtask_name: String, timeout: u64) {
        let _ = self.report_started(task_id, &subtask_name).await;
        let started = std::time::Instant::now();

        let outcome = match SubtaskKind::parse(&subtask_name) {
            Some(kind) => {
                let sampler = self.sampler.clone();
                let bound = Duration::from_secs(timeout.max(1));
                match tokio::time::timeout(bound, async move { subtasks::run(kind, sampler.as_ref()) }).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err("subtask timed out".to_string()),
                }
            }
            None => Err(format!("unknown subtask kind '{subtask_name}'")),
        };

        let elapsed = started.elapsed().as_secs_f64();
        let result = match outcome {
            Ok(value) => {
                let _ = self
                    .report_result(task_id, &subtask_name, ExecutionStatus::Completed, Some(value), None, Some(elapsed))
                    .await;
                Ok(())
            }
            Err(error) => {
                let _ = self
                    .report_result(task_id, &subtask_name, ExecutionStatus::Failed, None, Some(error), Some(elapsed))
                    .await;
                Ok(())
            }
        };
        *self.running.lock().await = None;
        let _: Result<()> = result;
    }

    async fn handle_cancel(&self, task_id: i64) {
        let mut slot = self.running.lock().await;
        if let Some(running) = slot.take() {
            if running.task_id == task_id {
                tracing::info!(task_id, subtask_name = %running.subtask_name, "cancellation received, reporting");
                drop(slot);
                let _ = self
                    .report_result(task_id, &running.subtask_name, ExecutionStatus::Cancelled, None, Some("cancelled".into()), None)
                    .await;
                return;
            }
            *slot = Some(running);
        }
    }

    async fn report_started(&self, task_id: i64, subtask_name: &str) -> Result<()> {
        let body = serde_json::json!({
            "task_id": task_id,
            "subtask_name": subtask_name,
            "agent": self.config.machine_name,
        });
        let url = format!("{}/api/execute", self.config.server_url);
        self.http.post(&url).json(&body).send().await?;
        Ok(())
    }

    async fn report_result(
        &self,
        task_id: i64,
        subtask_name: &str,
        status: ExecutionStatus,
        result: Option<serde_json::Value>,
        error: Option<String>,
        elapsed: Option<f64>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "task_id": task_id,
            "subtask_name": subtask_name,
            "agent": self.config.machine_name,
            "status": status,
            "result": result,
            "error": error,
            "elapsed": elapsed,
        });
        let url = format!("{}/api/subtask_result", self.config.server_url);
        self.http.post(&url).json(&body).send().await?;
        Ok(())
    }
}

/// Best-effort local IP discovery via a UDP connect trick (no packets sent).
/// Falls back to `None` on any platform where this fails (e.g. no route).
fn local_ip() -> Option<String> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AgentConfig {
        AgentConfig {
            server_url: "http://127.0.0.1:7700".into(),
            machine_name: "test-agent".into(),
            install_dir: ".".into(),
            heartbeat_interval_secs: 30,
            config_update_interval_secs: 600,
            log_level: "info".into(),
        }
    }

    #[test]
    fn websocket_url_rewrites_scheme_and_joins_path() {
        let runtime = AgentRuntime::new(test_config()).unwrap();
        assert_eq!(runtime.websocket_url(), "ws://127.0.0.1:7700/api/agents/test-agent/ws");
    }

    #[tokio::test]
    async fn a_fresh_runtime_is_not_running_anything() {
        let runtime = AgentRuntime::new(test_config()).unwrap();
        assert!(runtime.running.lock().await.is_none());
    }
}
