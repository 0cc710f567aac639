#![cfg(unix)]

mod common;

use chrono::Utc;
use claude_bridge::domains::assistant::ProcessStatus;
use claude_bridge::domains::git::CommitOutcome;
use claude_bridge::domains::sessions::{
    ChatScope, ContinueSessionRequest, MessageDirection, SessionRole, SessionStatus,
};
use claude_bridge::errors::BridgeError;
use claude_bridge::events::{ProgressKind, SessionEvent};
use claude_bridge::infrastructure::database::CredentialType;
use common::Harness;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn set_updated_at(harness: &Harness, session_id: &str, epoch_secs: i64) {
    let conn = harness.db.get_conn().unwrap();
    let changed = conn
        .execute(
            "UPDATE sessions SET updated_at = ?1 WHERE session_id = ?2",
            rusqlite::params![epoch_secs, session_id],
        )
        .unwrap();
    assert_eq!(changed, 1);
}

#[tokio::test]
async fn full_lifecycle_accumulates_cost_and_publishes_work() {
    let harness = Harness::new();
    let mut events = harness.manager.subscribe();

    let session = harness.start_active("feat-a", "C1").await;
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.work_tree_path.exists());
    assert_eq!(harness.wait_for_token(&session.session_id).await, "conv-123");

    let first = harness
        .manager
        .send_to_session(&session.session_id, "add a README")
        .await
        .unwrap();
    assert_eq!(first.text, "reply 2");
    let second = harness
        .manager
        .send_to_session(&session.session_id, "now tests")
        .await
        .unwrap();
    assert_eq!(second.text, "reply 3");

    let stored = harness.manager.get_session(&session.session_id).unwrap();
    assert!(
        (stored.running_cost - 0.0055).abs() < 1e-9,
        "running cost was {}",
        stored.running_cost
    );

    let messages = harness
        .manager
        .session_messages(&session.session_id, 10)
        .unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(
        messages
            .iter()
            .filter(|m| m.direction == MessageDirection::AssistantToUser)
            .count(),
        2
    );

    let report = harness.manager.end_session(&session.session_id).await.unwrap();
    assert!(report.is_clean(), "teardown errors: {:?}", report.errors);
    assert!(report.process_stopped);
    assert!(!report.assistant_crashed);
    assert!(matches!(report.commit, Some(CommitOutcome::Pushed { .. })));
    assert!(report.workspace_removed);
    assert!(!session.work_tree_path.exists());

    let ended = harness.manager.get_session(&session.session_id).unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert!(ended.ended_at.is_some());

    let commits = harness.provisioner.commits.lock().unwrap().clone();
    assert_eq!(
        commits,
        vec![(
            "feat-a".to_string(),
            format!("Session {} changes", session.session_id)
        )]
    );

    let mut statuses = Vec::new();
    let mut total_costs = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::StatusChanged { status, .. } => statuses.push(status),
            SessionEvent::CostUpdated { total_usd, .. } => total_costs.push(total_usd),
            _ => {}
        }
    }
    assert_eq!(
        statuses,
        vec![
            SessionStatus::Starting,
            SessionStatus::Active,
            SessionStatus::Ending,
            SessionStatus::Ended
        ]
    );
    assert_eq!(total_costs.len(), 2);

    let err = harness
        .manager
        .send_to_session(&session.session_id, "still there?")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ClaudeUnavailable { .. }));
}

#[tokio::test]
async fn concurrent_creates_for_one_feature_yield_one_session() {
    let harness = Harness::new();
    let first = harness.request("feat-dup", "C1");
    let second = harness.request("feat-dup", "C2");

    let results = std::thread::scope(|scope| {
        let a = scope.spawn(|| harness.manager.create_session(&first));
        let b = scope.spawn(|| harness.manager.create_session(&second));
        [a.join().unwrap(), b.join().unwrap()]
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .any(|r| matches!(r, Err(BridgeError::SessionExists { .. })))
    );
    assert_eq!(harness.manager.list_open_sessions().unwrap().len(), 1);
}

#[tokio::test]
async fn one_open_session_per_scope() {
    let harness = Harness::new();
    harness
        .manager
        .create_session(&harness.request("feat-a", "C1"))
        .unwrap();

    let err = harness
        .manager
        .create_session(&harness.request("feat-b", "C1"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionExists { .. }));

    let mut in_thread = harness.request("feat-c", "C1");
    in_thread.thread_ts = Some("1700000000.000100".into());
    harness.manager.create_session(&in_thread).unwrap();

    let in_other_channel = harness.request("feat-d", "C2");
    harness.manager.create_session(&in_other_channel).unwrap();
}

#[tokio::test]
async fn scope_frees_up_after_the_session_ends() {
    let harness = Harness::new();
    let session = harness.start_active("feat-a", "C1").await;
    harness.manager.end_session(&session.session_id).await.unwrap();

    let next = harness.start_active("feat-b", "C1").await;
    assert_eq!(next.status, SessionStatus::Active);

    let err = harness
        .manager
        .create_session(&harness.request("feat-a", "C3"))
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::SessionExists { .. }),
        "branch names stay reserved: {err:?}"
    );
}

#[tokio::test]
async fn per_user_limit_counts_open_sessions() {
    let harness = Harness::with(|session, _| session.max_sessions_per_user = 2);
    harness
        .manager
        .create_session(&harness.request("feat-a", "C1"))
        .unwrap();
    harness
        .manager
        .create_session(&harness.request("feat-b", "C2"))
        .unwrap();

    let err = harness
        .manager
        .create_session(&harness.request("feat-c", "C3"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionExists { .. }));
}

#[tokio::test]
async fn missing_credential_is_reported_before_anything_is_created() {
    let harness = Harness::new();
    let newcomer = harness
        .manager
        .create_or_update_user("T1", "U9", "nobody")
        .unwrap();
    let mut request = harness.request("feat-a", "C1");
    request.user_id = newcomer.id;

    let err = harness.manager.create_session(&request).unwrap_err();
    assert!(matches!(err, BridgeError::NoCredentials { .. }));
    assert!(!harness.manager.has_required_credentials(newcomer.id).unwrap());
    assert!(harness.manager.list_open_sessions().unwrap().is_empty());

    harness
        .manager
        .store_credential(newcomer.id, CredentialType::Anthropic, "  sk-new  ")
        .unwrap();
    assert!(harness.manager.has_required_credentials(newcomer.id).unwrap());
}

#[tokio::test]
async fn unknown_prompt_name_is_rejected() {
    let harness = Harness::new();
    let mut request = harness.request("feat-a", "C1");
    request.prompt = None;
    request.prompt_name = Some("does-not-exist".into());

    let err = harness.manager.create_session(&request).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidCommand { .. }));
}

#[tokio::test]
async fn failed_assistant_start_marks_error_and_removes_workspace() {
    let harness = Harness::with(|_, assistant| {
        assistant.executable = "/nonexistent/claude-missing".to_string();
    });

    let (session, progress) = harness.start(harness.request("feat-a", "C1")).await;
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(progress.last().map(|e| e.kind), Some(ProgressKind::Failed));
    assert!(
        progress
            .iter()
            .any(|e| e.kind == ProgressKind::WorkspaceReady)
    );
    assert!(!session.work_tree_path.exists());

    let retry = harness
        .manager
        .create_session(&harness.request("feat-b", "C1"))
        .unwrap();
    assert_eq!(retry.status, SessionStatus::Starting);
}

#[tokio::test]
async fn panicking_setup_marks_error_and_removes_workspace() {
    let harness = Harness::new();
    harness
        .provisioner
        .panic_on_setup
        .store(true, Ordering::SeqCst);

    let (session, progress) = harness.start(harness.request("feat-a", "C1")).await;
    assert_eq!(session.status, SessionStatus::Error);
    assert_eq!(progress.last().map(|e| e.kind), Some(ProgressKind::Failed));
    assert!(!session.work_tree_path.exists());
    assert!(
        !harness
            .manager
            .supervisor()
            .is_tracked(&session.session_id)
            .await
    );
}

#[tokio::test]
async fn end_reaches_ended_even_when_push_fails() {
    let harness = Harness::new();
    harness.provisioner.fail_push.store(true, Ordering::SeqCst);
    let session = harness.start_active("feat-a", "C1").await;

    let report = harness.manager.end_session(&session.session_id).await.unwrap();
    assert!(!report.is_clean());
    assert!(report.commit.is_none());
    assert!(report.errors.iter().any(|e| e.contains("remote rejected")));
    assert!(report.workspace_removed);

    let ended = harness.manager.get_session(&session.session_id).unwrap();
    assert_eq!(ended.status, SessionStatus::Ended);
}

#[tokio::test]
async fn crashed_assistant_work_is_still_published() {
    let harness = Harness::new();
    let session = harness.start_active("feat-a", "C1").await;

    let err = harness
        .manager
        .send_to_session(&session.session_id, "crash")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ClaudeUnavailable { .. }));

    for _ in 0..100 {
        if harness
            .manager
            .supervisor()
            .status(&session.session_id)
            .await
            == Some(ProcessStatus::Error)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = harness.manager.end_session(&session.session_id).await.unwrap();
    assert!(report.assistant_crashed);
    let commits = harness.provisioner.commits.lock().unwrap().clone();
    assert_eq!(commits.len(), 1);
    assert!(commits[0].1.ends_with("(assistant exited unexpectedly)"));
    assert_eq!(
        harness
            .manager
            .get_session(&session.session_id)
            .unwrap()
            .status,
        SessionStatus::Ended
    );
}

#[tokio::test]
async fn sends_require_an_active_session() {
    let harness = Harness::new();

    let err = harness
        .manager
        .send_to_session("no-such-session", "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionNotFound { .. }));

    let starting = harness
        .manager
        .create_session(&harness.request("feat-a", "C1"))
        .unwrap();
    let err = harness
        .manager
        .send_to_session(&starting.session_id, "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ClaudeUnavailable { .. }));

    let err = harness
        .manager
        .end_session(&starting.session_id)
        .await
        .unwrap_err();
    assert!(
        matches!(&err, BridgeError::ClaudeUnavailable { message, .. } if message.contains("starting")),
        "unexpected error: {err:?}"
    );

    let err = harness
        .manager
        .end_session("no-such-session")
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionNotFound { .. }));
}

#[tokio::test]
async fn ending_twice_only_tears_down_once() {
    let harness = Harness::new();
    let session = harness.start_active("feat-a", "C1").await;

    let (a, b) = tokio::join!(
        harness.manager.end_session(&session.session_id),
        harness.manager.end_session(&session.session_id),
    );
    assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        [&a, &b]
            .iter()
            .any(|r| matches!(r, Err(BridgeError::ClaudeUnavailable { .. })))
    );
    assert_eq!(harness.provisioner.commits.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn idle_sweep_ends_only_stale_sessions() {
    let harness = Harness::new();
    let stale = harness.start_active("feat-stale", "C1").await;
    let fresh = harness.start_active("feat-fresh", "C2").await;
    harness.wait_for_token(&stale.session_id).await;
    harness.wait_for_token(&fresh.session_id).await;

    let now = Utc::now();
    set_updated_at(&harness, &stale.session_id, now.timestamp() - 4000);
    set_updated_at(&harness, &fresh.session_id, now.timestamp() - 10);

    let plan = harness.manager.idle_candidates_at(now).unwrap();
    assert_eq!(plan.checked, 2);
    let planned: Vec<_> = plan.to_end.iter().map(|s| s.session_id.clone()).collect();
    assert_eq!(planned, vec![stale.session_id.clone()]);
    assert_eq!(
        harness.manager.get_session(&stale.session_id).unwrap().status,
        SessionStatus::Active,
        "planning must not end anything"
    );
    assert!(
        harness
            .manager
            .supervisor()
            .is_tracked(&stale.session_id)
            .await
    );

    let report = harness.manager.idle_sweep_at(now).await;
    assert_eq!(report.checked, 2);
    assert_eq!(report.ended, vec![stale.session_id.clone()]);
    assert!(report.failures.is_empty());

    assert_eq!(
        harness.manager.get_session(&stale.session_id).unwrap().status,
        SessionStatus::Ended
    );
    assert_eq!(
        harness.manager.get_session(&fresh.session_id).unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn continue_moves_session_for_members_only() {
    let harness = Harness::new();
    let mut events = harness.manager.subscribe();
    let session = harness.start_active("feat-a", "C1").await;
    let stranger = harness.add_user("U2", "bob");

    let target = ChatScope::new("T1", "C2", Some("1700000000.000200".into()));
    let request = |user_id| ContinueSessionRequest {
        feature_name: "feat-a".into(),
        user_id,
        scope: target.clone(),
    };

    let err = harness.manager.continue_session(&request(stranger.id)).unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized { .. }));

    let err = harness
        .manager
        .add_collaborator(&session.session_id, stranger.id, stranger.id)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized { .. }));

    harness
        .manager
        .add_collaborator(&session.session_id, harness.owner.id, stranger.id)
        .unwrap();
    harness
        .manager
        .add_collaborator(&session.session_id, harness.owner.id, stranger.id)
        .unwrap();

    let outcome = harness.manager.continue_session(&request(stranger.id)).unwrap();
    assert_eq!(outcome.moved_from, Some(session.scope()));
    assert_eq!(outcome.session.scope(), target);
    assert!(
        harness
            .manager
            .get_active_session_for_scope(&session.scope())
            .unwrap()
            .is_none()
    );

    let again = harness.manager.continue_session(&request(stranger.id)).unwrap();
    assert_eq!(again.moved_from, None);

    let mut moved = None;
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::Moved { from, to, .. } = event {
            moved = Some((from, to));
        }
    }
    assert_eq!(moved, Some((session.scope(), target.clone())));

    let err = harness
        .manager
        .stop_session(&session.session_id, stranger.id)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Unauthorized { .. }));

    harness
        .manager
        .stop_session(&session.session_id, harness.owner.id)
        .await
        .unwrap();
}

#[tokio::test]
async fn continue_into_an_occupied_scope_is_refused() {
    let harness = Harness::new();
    let _first = harness.start_active("feat-a", "C1").await;
    let second = harness.start_active("feat-b", "C2").await;

    let err = harness
        .manager
        .continue_session(&ContinueSessionRequest {
            feature_name: "feat-a".into(),
            user_id: harness.owner.id,
            scope: second.scope(),
        })
        .unwrap_err();
    assert!(matches!(err, BridgeError::SessionExists { .. }));
}

#[tokio::test]
async fn detached_session_resumes_with_its_continuation_token() {
    let harness = Harness::new();
    let session = harness.start_active("feat-a", "C1").await;
    harness.wait_for_token(&session.session_id).await;

    assert!(
        harness
            .manager
            .supervisor()
            .stop(&session.session_id)
            .await
            .unwrap()
    );

    let reply = harness
        .manager
        .send_to_session(&session.session_id, "are you back?")
        .await
        .unwrap();
    assert_eq!(reply.text, "reply 1");

    let info = harness
        .manager
        .get_session_info(&session.session_id)
        .await
        .unwrap();
    let process = info.process.expect("assistant should be tracked again");
    assert_eq!(process.continuation_token.as_deref(), Some("conv-123"));
    assert!(info.repo.is_some());
    assert_eq!(info.members.len(), 1);
    assert_eq!(info.members[0].user_id, harness.owner.id);
    assert_eq!(info.members[0].role, SessionRole::Owner);
}

#[tokio::test]
async fn recovery_fails_interrupted_setups() {
    let harness = Harness::new();
    let orphan = harness
        .manager
        .create_session(&harness.request("feat-a", "C1"))
        .unwrap();

    let report = harness.manager.recover_after_restart().await.unwrap();
    assert_eq!(report.failed_setups, vec![orphan.session_id.clone()]);
    assert!(report.resumable.is_empty());
    assert_eq!(
        harness.manager.get_session(&orphan.session_id).unwrap().status,
        SessionStatus::Error
    );
}

#[tokio::test]
async fn shutdown_ends_every_active_session() {
    let harness = Harness::new();
    let a = harness.start_active("feat-a", "C1").await;
    let b = harness.start_active("feat-b", "C2").await;

    let report = harness.manager.end_all_active_sessions().await;
    assert_eq!(report.ended.len(), 2);
    assert!(report.failures.is_empty());
    assert!(harness.manager.supervisor().tracked_sessions().await.is_empty());

    for id in [&a.session_id, &b.session_id] {
        assert_eq!(
            harness.manager.get_session(id).unwrap().status,
            SessionStatus::Ended
        );
    }

    let (late, progress) = harness.start(harness.request("feat-c", "C3")).await;
    assert_eq!(late.status, SessionStatus::Error);
    assert_eq!(progress.last().map(|e| e.kind), Some(ProgressKind::Failed));
}

#[tokio::test]
async fn shutdown_during_setup_leaves_no_assistant_running() {
    let harness = Harness::new();
    harness
        .provisioner
        .setup_delay_ms
        .store(500, Ordering::SeqCst);

    let (session, stream) = harness
        .manager
        .start_session(harness.request("feat-a", "C1"))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let report = harness.manager.end_all_active_sessions().await;
    assert!(report.ended.is_empty());
    assert!(report.stop_all.stopped.is_empty());

    let progress = tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("setup should settle before shutdown returns");
    assert_eq!(progress.last().map(|e| e.kind), Some(ProgressKind::Failed));
    assert!(
        !progress
            .iter()
            .any(|e| e.kind == ProgressKind::StartingAssistant)
    );

    let session = harness.manager.get_session(&session.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Error);
    assert!(!session.work_tree_path.exists());
    assert!(harness.manager.supervisor().tracked_sessions().await.is_empty());
}
