use crate::domains::sessions::entity::{ChatScope, SessionStatus};
use futures::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Notifications for the chat side about sessions it may be displaying.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },
    Output {
        session_id: String,
        text: String,
    },
    CostUpdated {
        session_id: String,
        delta_usd: f64,
        total_usd: f64,
    },
    Moved {
        session_id: String,
        from: ChatScope,
        to: ChatScope,
    },
}

impl SessionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::StatusChanged { .. } => "bridge:session-status-changed",
            SessionEvent::Output { .. } => "bridge:session-output",
            SessionEvent::CostUpdated { .. } => "bridge:session-cost-updated",
            SessionEvent::Moved { .. } => "bridge:session-moved",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StatusChanged { session_id, .. }
            | SessionEvent::Output { session_id, .. }
            | SessionEvent::CostUpdated { session_id, .. }
            | SessionEvent::Moved { session_id, .. } => session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Validating,
    Cloning,
    OpeningCache,
    Fetching,
    Resolving,
    Branching,
    Materializing,
    WorkspaceReady,
    ResolvingPrompt,
    StartingAssistant,
    Ready,
    Failed,
}

impl ProgressKind {
    pub fn is_final(&self) -> bool {
        matches!(self, ProgressKind::Ready | ProgressKind::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub session_id: String,
    pub kind: ProgressKind,
    pub message: String,
}

/// Producer half of a setup progress stream. Sending never blocks, so it is
/// usable from blocking git work.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    session_id: String,
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSender {
    pub fn channel(session_id: &str) -> (Self, ProgressStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id: session_id.to_string(),
                tx: Some(tx),
            },
            ProgressStream { rx },
        )
    }

    /// Progress that is only logged.
    pub fn log_only(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tx: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn send(&self, kind: ProgressKind, message: impl Into<String>) {
        let message = message.into();
        if kind == ProgressKind::Failed {
            log::warn!("[session:{}] Setup failed: {message}", self.session_id);
        } else {
            log::info!("[session:{}] {message}", self.session_id);
        }

        if let Some(tx) = &self.tx
            && tx
                .send(ProgressEvent {
                    session_id: self.session_id.clone(),
                    kind,
                    message,
                })
                .is_err()
        {
            log::debug!(
                "[session:{}] Progress receiver dropped; continuing without updates",
                self.session_id
            );
        }
    }
}

/// Consumer half. Ends after the producer side is gone; dropping it cancels nothing.
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressStream {
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
