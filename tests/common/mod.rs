#![allow(dead_code)]

use async_trait::async_trait;
use claude_bridge::config::{AssistantConfig, SessionConfig};
use claude_bridge::domains::assistant::InputFormat;
use claude_bridge::domains::git::{
    CommitOutcome, RepoInfo, SetupRequest, WorkspaceError, WorkspaceProvisioner,
};
use claude_bridge::domains::sessions::{CreateSessionRequest, Session, SessionManager};
use claude_bridge::events::{ProgressEvent, ProgressKind, ProgressSender};
use claude_bridge::infrastructure::database::{CredentialType, Database, User};
use futures::StreamExt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Speaks the stream-json output protocol over plain-text input.
/// Reply costs are 0, 0.002, then 0.0035 for every later turn.
const FAKE_ASSISTANT: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"conv-123","tools":[]}'
n=0
while IFS= read -r line; do
  case "$line" in
    exit) exit 0 ;;
    crash) echo "fatal: simulated crash" >&2; exit 3 ;;
    hang) sleep 30 ;;
    slow) sleep 1.5 ;;
  esac
  n=$((n + 1))
  case "$n" in
    1) cost=0 ;;
    2) cost=0.002 ;;
    *) cost=0.0035 ;;
  esac
  echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working"}]},"session_id":"conv-123"}'
  echo "{\"type\":\"result\",\"subtype\":\"success\",\"total_cost_usd\":$cost,\"is_error\":false,\"num_turns\":1,\"result\":\"reply $n\",\"session_id\":\"conv-123\"}"
done
"#;

pub fn write_fake_assistant(dir: &Path) -> PathBuf {
    let path = dir.join("fake-claude.sh");
    fs::write(&path, FAKE_ASSISTANT).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn assistant_config(executable: &Path) -> AssistantConfig {
    AssistantConfig {
        executable: executable.to_string_lossy().to_string(),
        args: Vec::new(),
        input_format: InputFormat::Text,
        exit_sentinel: Some("exit".to_string()),
        response_timeout_secs: 5,
        stop_grace_secs: 2,
        shutdown_timeout_secs: 10,
        ..AssistantConfig::default()
    }
}

/// Provisioner that only creates directories and records publish requests.
pub struct FakeProvisioner {
    root: PathBuf,
    pub fail_push: AtomicBool,
    /// Panics after the workspace directory exists.
    pub panic_on_setup: AtomicBool,
    /// Extra setup latency that does not observe cancellation.
    pub setup_delay_ms: AtomicU64,
    pub commits: Mutex<Vec<(String, String)>>,
}

impl FakeProvisioner {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            fail_push: AtomicBool::new(false),
            panic_on_setup: AtomicBool::new(false),
            setup_delay_ms: AtomicU64::new(0),
            commits: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WorkspaceProvisioner for FakeProvisioner {
    fn workspace_path(&self, feature_name: &str) -> PathBuf {
        self.root.join(feature_name)
    }

    async fn validate_repo_url(
        &self,
        _repo_url: &str,
        _github_token: Option<String>,
    ) -> Result<(), WorkspaceError> {
        Ok(())
    }

    async fn setup(
        &self,
        request: SetupRequest,
        progress: ProgressSender,
        cancel: CancellationToken,
    ) -> Result<PathBuf, WorkspaceError> {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }
        let delay = self.setup_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let workspace = self.workspace_path(&request.feature_name);
        fs::create_dir_all(&workspace)?;
        if self.panic_on_setup.load(Ordering::SeqCst) {
            panic!("provisioner blew up in {}", workspace.display());
        }
        fs::write(workspace.join("README.md"), "# fake\n")?;
        progress.send(ProgressKind::WorkspaceReady, "Workspace ready");
        Ok(workspace)
    }

    async fn commit_and_push(
        &self,
        _workspace: &Path,
        branch: &str,
        message: &str,
        _github_token: Option<String>,
    ) -> Result<CommitOutcome, WorkspaceError> {
        self.commits
            .lock()
            .unwrap()
            .push((branch.to_string(), message.to_string()));
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(WorkspaceError::PushFailed {
                branch: branch.to_string(),
                message: "remote rejected".to_string(),
            });
        }
        Ok(CommitOutcome::Pushed {
            commit: "0123abcd".to_string(),
        })
    }

    async fn cleanup(&self, workspace: &Path) -> Result<(), WorkspaceError> {
        match fs::remove_dir_all(workspace) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn repo_info(&self, workspace: &Path) -> Result<RepoInfo, WorkspaceError> {
        Ok(RepoInfo {
            path: workspace.to_path_buf(),
            branch: workspace
                .file_name()
                .map(|name| name.to_string_lossy().to_string()),
            head_commit: None,
            remote_url: None,
            is_dirty: false,
        })
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub db: Database,
    pub manager: SessionManager,
    pub provisioner: Arc<FakeProvisioner>,
    pub owner: User,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_, _| {})
    }

    /// Must be called from inside a tokio runtime.
    pub fn with(customize: impl FnOnce(&mut SessionConfig, &mut AssistantConfig)) -> Self {
        let temp = TempDir::new().unwrap();
        let script = write_fake_assistant(temp.path());
        let mut session_config = SessionConfig {
            work_dir: temp.path().join("work"),
            ..SessionConfig::default()
        };
        let mut assistant = assistant_config(&script);
        customize(&mut session_config, &mut assistant);

        let db = Database::new(&temp.path().join("bridge.db")).unwrap();
        let provisioner = Arc::new(FakeProvisioner::new(temp.path().join("worktrees")));
        let manager = SessionManager::with_provisioner(
            db.clone(),
            session_config,
            assistant,
            provisioner.clone(),
        );

        let owner = manager.create_or_update_user("T1", "U1", "alice").unwrap();
        manager
            .store_credential(owner.id, CredentialType::Anthropic, "sk-test")
            .unwrap();

        Self {
            temp,
            db,
            manager,
            provisioner,
            owner,
        }
    }

    pub fn add_user(&self, external_id: &str, name: &str) -> User {
        let user = self
            .manager
            .create_or_update_user("T1", external_id, name)
            .unwrap();
        self.manager
            .store_credential(user.id, CredentialType::Anthropic, "sk-other")
            .unwrap();
        user
    }

    pub fn request(&self, feature: &str, channel: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            workspace_id: "T1".into(),
            user_id: self.owner.id,
            channel_id: channel.into(),
            thread_ts: None,
            repo_url: "https://github.com/acme/widgets.git".into(),
            from_commitish: "main".into(),
            feature_name: feature.into(),
            model: "sonnet".into(),
            prompt: Some("Be brief".into()),
            prompt_name: None,
        }
    }

    /// Runs the full start flow and returns the progress it reported.
    pub async fn start(
        &self,
        request: CreateSessionRequest,
    ) -> (Session, Vec<ProgressEvent>) {
        let (session, stream) = self.manager.start_session(request).unwrap();
        let events = tokio::time::timeout(Duration::from_secs(20), stream.collect::<Vec<_>>())
            .await
            .expect("setup should finish");
        (self.manager.get_session(&session.session_id).unwrap(), events)
    }

    pub async fn start_active(&self, feature: &str, channel: &str) -> Session {
        let (session, events) = self.start(self.request(feature, channel)).await;
        assert_eq!(
            events.last().map(|e| e.kind),
            Some(ProgressKind::Ready),
            "unexpected progress: {events:?}"
        );
        session
    }

    pub async fn wait_for_token(&self, session_id: &str) -> String {
        for _ in 0..100 {
            if let Some(token) = self
                .manager
                .get_session(session_id)
                .unwrap()
                .assistant_session_id
            {
                return token;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("continuation token was never persisted for {session_id}");
    }
}
