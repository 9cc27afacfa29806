use super::args::{one_shot_args, resolve_binary, AgentSettings, LaunchOptions};
use super::error::AgentError;
use super::registry::{ProcessKind, ProcessRegistry, TrackedProcess};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct OneShotRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub launch: LaunchOptions,
    /// Generated when absent.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OneShotOutcome {
    pub session_id: String,
    pub result: Option<String>,
    pub is_error: bool,
    pub raw: Value,
}

/// Runs a single non-persistent agent invocation, used to create sessions.
#[derive(Clone)]
pub struct OneShotRunner {
    settings: AgentSettings,
    registry: ProcessRegistry,
}

impl OneShotRunner {
    pub fn new(settings: AgentSettings, registry: ProcessRegistry) -> Self {
        Self { settings, registry }
    }

    pub async fn run(&self, request: OneShotRequest) -> Result<OneShotOutcome, AgentError> {
        let session_id = request
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let binary_name = self.settings.binary.as_str();
        let binary = resolve_binary(binary_name)?;
        let args = one_shot_args(&self.settings, &session_id, &request.prompt, &request.launch);

        let child = Command::new(&binary)
            .args(&args)
            .current_dir(&request.cwd)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AgentError::not_installed(binary_name),
                _ => AgentError::spawn(binary_name, e),
            })?;

        let exited = Arc::new(AtomicBool::new(false));
        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.register(
                &session_id,
                TrackedProcess {
                    pid,
                    kind: ProcessKind::OneShot,
                    exited: Arc::clone(&exited),
                },
            );
        }
        log::info!("Started one-shot agent run for {session_id}");

        let limit = self.settings.one_shot_timeout;
        let waited = timeout(limit, child.wait_with_output()).await;
        exited.store(true, Ordering::SeqCst);
        if let Some(pid) = pid {
            self.registry.unregister(&session_id, pid);
        }

        // On timeout the dropped future drops the child, and kill_on_drop kills it.
        let output = match waited {
            Ok(output) => output?,
            Err(_) => {
                log::warn!("One-shot run for {session_id} timed out after {limit:?}; killed");
                return Err(AgentError::Timeout { after: limit });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            return Err(AgentError::ProcessDeath {
                message: format!("exited with {}", output.status),
                stderr,
            });
        }

        let raw = parse_result(&stdout).ok_or_else(|| AgentError::ProcessDeath {
            message: "agent produced no result record".to_string(),
            stderr: stderr.clone(),
        })?;
        Ok(OneShotOutcome {
            session_id: raw
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(session_id),
            result: raw.get("result").and_then(Value::as_str).map(str::to_string),
            is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            raw,
        })
    }
}

/// `--output-format json` prints one object; tolerate stray lines around it.
fn parse_result(stdout: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }
    stdout
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find(|value| value.get("type").and_then(Value::as_str) == Some("result"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn runner(tmp: &TempDir, script: &str, limit: Duration) -> (OneShotRunner, ProcessRegistry) {
        let script_path = tmp.path().join("agent.sh");
        std::fs::write(&script_path, script).unwrap();
        let settings = AgentSettings {
            binary: "/bin/sh".into(),
            projects_dir: tmp.path().join("projects"),
            stop_grace: Duration::from_secs(3),
            one_shot_timeout: limit,
            extra_args: vec![script_path.to_string_lossy().to_string()],
        };
        let registry = ProcessRegistry::new(settings.stop_grace);
        (OneShotRunner::new(settings, registry.clone()), registry)
    }

    fn request(tmp: &TempDir, session_id: Option<&str>) -> OneShotRequest {
        OneShotRequest {
            prompt: "create".into(),
            cwd: tmp.path().to_path_buf(),
            launch: LaunchOptions::default(),
            session_id: session_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn returns_result_with_requested_session_id() {
        let tmp = TempDir::new().unwrap();
        let script = r#"while [ $# -gt 0 ]; do
  if [ "$1" = "--session-id" ]; then sid="$2"; fi
  shift
done
printf '{"type":"result","subtype":"success","is_error":false,"result":"created","session_id":"%s"}\n' "$sid"
"#;
        let (runner, registry) = runner(&tmp, script, Duration::from_secs(10));
        let outcome = runner.run(request(&tmp, Some("fixed-id"))).await.unwrap();
        assert_eq!(outcome.session_id, "fixed-id");
        assert_eq!(outcome.result.as_deref(), Some("created"));
        assert!(!outcome.is_error);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("finished");
        let script = format!("sleep 2\ntouch '{}'\n", marker.display());
        let (runner, registry) = runner(&tmp, &script, Duration::from_millis(300));

        let err = runner.run(request(&tmp, None)).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "timed-out run kept going");
    }

    #[tokio::test]
    async fn failing_run_surfaces_stderr() {
        let tmp = TempDir::new().unwrap();
        let (runner, _) = runner(&tmp, "echo 'auth required' >&2\nexit 1\n", Duration::from_secs(10));
        match runner.run(request(&tmp, None)).await.unwrap_err() {
            AgentError::ProcessDeath { stderr, .. } => assert_eq!(stderr, "auth required"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_result_tolerates_noise() {
        let stdout = "warming up\n{\"type\":\"result\",\"result\":\"x\"}\n";
        assert_eq!(parse_result(stdout).unwrap()["result"], "x");
        assert!(parse_result("nothing here").is_none());
    }
}
