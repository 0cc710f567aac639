use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::AssistantConfig;

pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Flags that keep the assistant from phoning home or asking for feedback.
const QUIET_ENV: &[(&str, &str)] = &[
    ("DISABLE_TELEMETRY", "1"),
    ("DISABLE_ERROR_REPORTING", "1"),
    ("DISABLE_BUG_COMMAND", "1"),
    ("DISABLED_NON_ESSENTIAL_MODEL_CALLS", "1"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

/// Resolves the executable on `PATH` (or as given when it contains a separator).
pub fn resolve_executable(executable: &str) -> Option<PathBuf> {
    which::which(executable).ok()
}

pub fn build_launch_plan(
    config: &AssistantConfig,
    program: PathBuf,
    working_dir: &Path,
    model: &str,
    credential: &str,
    resume_token: Option<&str>,
) -> LaunchPlan {
    let mut args = config.args.clone();
    if let Some(token) = resume_token.filter(|t| !t.trim().is_empty()) {
        args.push(config.resume_flag.clone());
        args.push(token.to_string());
    }
    args.push(config.model_flag.clone());
    args.push(model.to_string());

    let mut env: HashMap<String, String> = config.env.iter().cloned().collect();
    for (key, value) in QUIET_ENV {
        env.insert((*key).to_string(), (*value).to_string());
    }
    env.insert(API_KEY_ENV.to_string(), credential.to_string());

    LaunchPlan {
        program,
        args,
        cwd: working_dir.to_path_buf(),
        env,
    }
}

impl LaunchPlan {
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        command.current_dir(&self.cwd);
        command.envs(&self.env);
        command.stdin(std::process::Stdio::piped());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        command.kill_on_drop(true);
        command
    }

    /// Loggable form. Leaves out the environment, which holds the credential.
    pub fn describe(&self) -> String {
        format!(
            "{} {} (cwd={})",
            self.program.display(),
            self.args.join(" "),
            self.cwd.display()
        )
    }
}
