use super::error::AgentError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const STREAM_JSON_ARGS: &[&str] = &[
    "-p",
    "--input-format",
    "stream-json",
    "--output-format",
    "stream-json",
    "--verbose",
];

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub binary: String,
    /// Root of the agent's per-project conversation logs.
    pub projects_dir: PathBuf,
    pub stop_grace: Duration,
    pub one_shot_timeout: Duration,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionPolicy {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "bypassPermissions")]
    BypassPermissions,
}

impl PermissionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionPolicy::Default => "default",
            PermissionPolicy::AcceptEdits => "acceptEdits",
            PermissionPolicy::Plan => "plan",
            PermissionPolicy::BypassPermissions => "bypassPermissions",
        }
    }
}

/// The part of an invocation that varies per request. A live process whose
/// launch options differ from a new request's is recycled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    pub permission: PermissionPolicy,
    pub model: Option<String>,
}

impl LaunchOptions {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.permission != PermissionPolicy::Default {
            args.push("--permission-mode".to_string());
            args.push(self.permission.as_str().to_string());
        }
        if let Some(model) = self.model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        args
    }
}

pub fn sanitize_path_for_projects(path: &Path) -> String {
    path.to_string_lossy().replace(['/', '.', '_'], "-")
}

/// Where the agent CLI keeps the log for `session_id` started in `cwd`.
pub fn conversation_log_path(projects_dir: &Path, cwd: &Path, session_id: &str) -> PathBuf {
    projects_dir
        .join(sanitize_path_for_projects(cwd))
        .join(format!("{session_id}.jsonl"))
}

pub fn persistent_args(
    settings: &AgentSettings,
    session_id: &str,
    resume: bool,
    launch: &LaunchOptions,
) -> Vec<String> {
    let mut args = settings.extra_args.clone();
    args.extend(STREAM_JSON_ARGS.iter().map(|arg| arg.to_string()));
    args.push(if resume { "--resume" } else { "--session-id" }.to_string());
    args.push(session_id.to_string());
    args.extend(launch.to_args());
    args
}

pub fn one_shot_args(
    settings: &AgentSettings,
    session_id: &str,
    prompt: &str,
    launch: &LaunchOptions,
) -> Vec<String> {
    let mut args = settings.extra_args.clone();
    args.extend([
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--session-id".to_string(),
        session_id.to_string(),
    ]);
    args.extend(launch.to_args());
    args
}

/// Resolves the configured binary through `PATH` (or as a path).
pub fn resolve_binary(binary: &str) -> Result<PathBuf, AgentError> {
    let trimmed = binary.trim();
    which::which(trimmed).map_err(|e| {
        log::warn!("Agent binary '{trimmed}' not found: {e}");
        AgentError::not_installed(trimmed)
    })
}
