use super::command::{build_launch_plan, resolve_executable};
use super::process::{AssistantEvent, AssistantProcess, ProcessInfo, ProcessStatus, TurnReply};
use crate::config::AssistantConfig;
use crate::errors::BridgeError;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

pub type AssistantEvents = mpsc::UnboundedReceiver<AssistantEvent>;

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub working_dir: PathBuf,
    pub model: String,
    pub credential: String,
    pub initial_message: Option<String>,
    pub resume_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopAllReport {
    pub stopped: Vec<String>,
    pub failures: Vec<(String, String)>,
    pub timed_out: bool,
}

/// Owns one assistant process per session id.
pub struct AssistantSupervisor {
    config: AssistantConfig,
    processes: RwLock<HashMap<String, Arc<AssistantProcess>>>,
    events: mpsc::UnboundedSender<AssistantEvent>,
}

impl AssistantSupervisor {
    pub fn new(config: AssistantConfig) -> (Arc<Self>, AssistantEvents) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            config,
            processes: RwLock::new(HashMap::new()),
            events,
        });
        (supervisor, receiver)
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    pub async fn start(&self, request: StartRequest) -> Result<ProcessInfo, BridgeError> {
        let mut processes = self.processes.write().await;
        if processes.contains_key(&request.session_id) {
            return Err(BridgeError::session_exists(format!(
                "an assistant is already running for session {}",
                request.session_id
            )));
        }

        let program = resolve_executable(&self.config.executable).ok_or_else(|| {
            BridgeError::unavailable(
                &request.session_id,
                format!("'{}' was not found on PATH", self.config.executable),
            )
        })?;

        let plan = build_launch_plan(
            &self.config,
            program,
            &request.working_dir,
            &request.model,
            &request.credential,
            request.resume_token.as_deref(),
        );
        let process = AssistantProcess::spawn(
            &request.session_id,
            &plan,
            self.config.input_format,
            request.resume_token.clone(),
            self.events.clone(),
        )?;
        processes.insert(request.session_id.clone(), process.clone());
        drop(processes);

        process.begin_initial_turn(request.initial_message);
        Ok(process.info())
    }

    /// Writes one message and waits for the assistant's matching result.
    pub async fn send(&self, session_id: &str, message: &str) -> Result<TurnReply, BridgeError> {
        let process = self
            .lookup(session_id)
            .await
            .ok_or_else(|| BridgeError::not_found(session_id))?;
        process
            .send(message, self.config.response_timeout())
            .await
    }

    /// `Ok(false)` when nothing was tracked under `session_id`.
    pub async fn stop(&self, session_id: &str) -> Result<bool, BridgeError> {
        let Some(process) = self.processes.write().await.remove(session_id) else {
            return Ok(false);
        };

        let outcome = process
            .shutdown(self.config.stop_grace(), self.config.exit_sentinel.as_deref())
            .await?;
        log::info!(
            "[assistant:{session_id}] Stopped (forced={}, code={:?}, status={})",
            outcome.forced,
            outcome.exit.code,
            outcome.status
        );
        Ok(true)
    }

    pub async fn stop_all(&self) -> StopAllReport {
        let processes: Vec<Arc<AssistantProcess>> = {
            let mut map = self.processes.write().await;
            map.drain().map(|(_, process)| process).collect()
        };
        let mut report = StopAllReport::default();
        if processes.is_empty() {
            return report;
        }

        let grace = self.config.stop_grace();
        let sentinel = self.config.exit_sentinel.as_deref();
        let shutdowns = processes.iter().map(|process| async move {
            (
                process.session_id().to_string(),
                process.shutdown(grace, sentinel).await,
            )
        });

        match tokio::time::timeout(self.config.shutdown_timeout(), join_all(shutdowns)).await {
            Ok(results) => {
                for (session_id, result) in results {
                    match result {
                        Ok(_) => report.stopped.push(session_id),
                        Err(err) => report.failures.push((session_id, err.to_string())),
                    }
                }
            }
            Err(_) => {
                log::warn!(
                    "[assistant] Shutdown exceeded {:?}; killing remaining processes",
                    self.config.shutdown_timeout()
                );
                report.timed_out = true;
                for process in &processes {
                    let session_id = process.session_id().to_string();
                    if process.status().has_exited() {
                        report.stopped.push(session_id);
                    } else {
                        process.force_kill();
                        report
                            .failures
                            .push((session_id, "killed after shutdown timeout".to_string()));
                    }
                }
            }
        }

        log::info!(
            "[assistant] Stopped {} process(es), {} failure(s)",
            report.stopped.len(),
            report.failures.len()
        );
        report
    }

    pub async fn status(&self, session_id: &str) -> Option<ProcessStatus> {
        self.lookup(session_id).await.map(|p| p.status())
    }

    pub async fn info(&self, session_id: &str) -> Option<ProcessInfo> {
        self.lookup(session_id).await.map(|p| p.info())
    }

    pub async fn stderr_tail(&self, session_id: &str) -> Vec<String> {
        self.lookup(session_id)
            .await
            .map(|p| p.stderr_tail())
            .unwrap_or_default()
    }

    pub async fn is_tracked(&self, session_id: &str) -> bool {
        self.processes.read().await.contains_key(session_id)
    }

    pub async fn tracked_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn lookup(&self, session_id: &str) -> Option<Arc<AssistantProcess>> {
        self.processes.read().await.get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session_id: &str) -> StartRequest {
        StartRequest {
            session_id: session_id.to_string(),
            working_dir: std::env::temp_dir(),
            model: "sonnet".to_string(),
            credential: "sk-test".to_string(),
            initial_message: None,
            resume_token: None,
        }
    }

    #[tokio::test]
    async fn missing_executable_is_unavailable() {
        let config = AssistantConfig {
            executable: "definitely-not-an-assistant-binary-42".to_string(),
            ..AssistantConfig::default()
        };
        let (supervisor, _events) = AssistantSupervisor::new(config);

        let err = supervisor.start(request("s1")).await.unwrap_err();
        assert_eq!(err.code(), "CLAUDE_UNAVAILABLE");
        assert!(supervisor.tracked_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn untracked_sessions() {
        let (supervisor, _events) = AssistantSupervisor::new(AssistantConfig::default());

        assert!(!supervisor.stop("ghost").await.unwrap());
        assert!(supervisor.status("ghost").await.is_none());
        let err = supervisor.send("ghost", "hi").await.unwrap_err();
        assert_eq!(err, BridgeError::not_found("ghost"));
        assert_eq!(supervisor.stop_all().await, StopAllReport::default());
    }
}
