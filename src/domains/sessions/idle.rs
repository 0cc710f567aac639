use crate::domains::sessions::entity::{Session, SessionStatus};
use crate::domains::sessions::service::SessionManager;
use crate::errors::BridgeError;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub checked: usize,
    pub ended: Vec<String>,
    /// Idle but not `active`, so not ours to end.
    pub skipped: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// What a sweep at a given instant would do, without doing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdlePlan {
    pub checked: usize,
    pub to_end: Vec<Session>,
    pub skipped: Vec<String>,
}

impl SessionManager {
    pub fn idle_candidates(&self) -> Result<IdlePlan, BridgeError> {
        self.idle_candidates_at(Utc::now())
    }

    /// Read-only: classifies open sessions idle longer than the idle timeout.
    pub fn idle_candidates_at(&self, now: DateTime<Utc>) -> Result<IdlePlan, BridgeError> {
        let sessions = self.list_open_sessions()?;
        let threshold = chrono::Duration::from_std(self.config().idle_timeout())
            .map_err(|e| BridgeError::internal(format!("idle timeout out of range: {e}")))?;

        let mut plan = IdlePlan {
            checked: sessions.len(),
            ..IdlePlan::default()
        };
        for session in sessions {
            let idle = session.idle_for(now);
            if idle <= threshold {
                continue;
            }
            if session.status == SessionStatus::Active {
                plan.to_end.push(session);
            } else {
                debug!(
                    "[idle] Session {} idle for {}s but {}",
                    session.session_id,
                    idle.num_seconds(),
                    session.status
                );
                plan.skipped.push(session.session_id);
            }
        }
        Ok(plan)
    }

    pub async fn idle_sweep(&self) -> SweepReport {
        self.idle_sweep_at(Utc::now()).await
    }

    /// Ends every `active` session whose last activity is older than the idle timeout.
    pub async fn idle_sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let plan = match self.idle_candidates_at(now) {
            Ok(plan) => plan,
            Err(e) => {
                warn!("[idle] Failed to plan sweep: {e}");
                report.failures.push(("*".to_string(), e.to_string()));
                return report;
            }
        };
        report.checked = plan.checked;
        report.skipped = plan.skipped;

        for session in plan.to_end {
            info!(
                "[idle] Ending session {} after {}s without activity",
                session.session_id,
                session.idle_for(now).num_seconds()
            );
            match self.end_session(&session.session_id).await {
                Ok(_) => report.ended.push(session.session_id),
                Err(e) => {
                    warn!("[idle] Failed to end session {}: {e}", session.session_id);
                    report.failures.push((session.session_id, e.to_string()));
                }
            }
        }
        report
    }

    /// Sweeps on the configured interval until `cancel` fires. The first sweep
    /// happens one full interval after start.
    pub fn spawn_idle_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = manager.config().sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("[idle] Sweeping every {period:?}");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.idle_sweep().await;
                        if !report.ended.is_empty() || !report.failures.is_empty() {
                            info!(
                                "[idle] Ended {} idle session(s), {} failure(s)",
                                report.ended.len(),
                                report.failures.len()
                            );
                        }
                    }
                }
            }
            debug!("[idle] Sweeper stopped");
        })
    }
}
