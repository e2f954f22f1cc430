//! Subprocess [`StepExecutor`].
//!
//! Spawns the configured agent command once per delegation, writes the
//! request to its stdin as JSON and reads a single JSON value from stdout.
//! The dispatcher owns the timeout; the child is killed if the call is
//! dropped.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, bail};
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_core::workflow::collaborator::{AgentError, StepExecutor};
use stepwise_types::config::AgentCommandConfig;
use stepwise_types::delegation::DelegationRequest;
use tokio::io::AsyncWriteExt;

/// Runs an external agent program per delegation request.
#[derive(Debug, Clone)]
pub struct CommandStepExecutor {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandStepExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// Build from the `[agent]` config table. `None` when no command is set.
    pub fn from_config(config: &AgentCommandConfig) -> Option<Self> {
        let (program, args) = config.command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            env: config.env.clone(),
            working_dir: None,
        })
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    async fn spawn_and_collect(&self, payload: Vec<u8>) -> anyhow::Result<String> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn agent command '{}'", self.program))?;

        // stdin is fed concurrently with draining stdout and stderr.
        let stdin = child.stdin.take();
        let program = self.program.as_str();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(&payload).await {
                Ok(()) => Ok(()),
                // The agent may exit without reading its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    tracing::debug!(program, "agent closed stdin early");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output.context("Failed to wait for agent process")?;
        fed.context("Failed to write delegation request to agent stdin")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "agent command '{}' exited with status {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("Agent output is not valid UTF-8")
    }
}

impl StepExecutor for CommandStepExecutor {
    fn execute(&self, request: DelegationRequest) -> BoxFuture<'_, Result<Value, AgentError>> {
        Box::pin(async move {
            let payload = serde_json::to_vec(&request)
                .map_err(|e| AgentError::Failed(format!("could not encode request: {e}")))?;

            tracing::debug!(
                run_id = %request.run_id,
                step = %request.step,
                program = %self.program,
                "delegating step to agent command"
            );

            let stdout = self
                .spawn_and_collect(payload)
                .await
                .map_err(|e| AgentError::Failed(format!("{e:#}")))?;

            let trimmed = stdout.trim();
            if trimmed.is_empty() {
                return Err(AgentError::InvalidResponse(
                    "agent produced no output".to_string(),
                ));
            }
            serde_json::from_str(trimmed).map_err(|e| AgentError::InvalidResponse(e.to_string()))
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::StepType;
    use uuid::Uuid;

    fn request() -> DelegationRequest {
        DelegationRequest {
            run_id: Uuid::now_v7(),
            step: "create_branch".to_string(),
            step_type: StepType::Python,
            action: Some("create_branch".to_string()),
            intent: "Create a git branch".to_string(),
            inputs: json!({ "branch_name": "feat-x" }),
            prompt_suffix: None,
            prompt_file: None,
            output_schema: None,
            workflow_active: true,
        }
    }

    fn sh(script: &str) -> CommandStepExecutor {
        CommandStepExecutor::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn request_is_written_to_stdin() {
        let value = sh("cat").execute(request()).await.unwrap();
        assert_eq!(value["step"], json!("create_branch"));
        assert_eq!(value["inputs"]["branch_name"], json!("feat-x"));
        assert_eq!(value["workflow_active"], json!(true));
    }

    #[tokio::test]
    async fn configured_env_reaches_the_agent() {
        let config = AgentCommandConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat > /dev/null; printf '"%s"' "$AGENT_MODEL""#.to_string(),
            ],
            env: BTreeMap::from([("AGENT_MODEL".to_string(), "fast".to_string())]),
        };
        let executor = CommandStepExecutor::from_config(&config).unwrap();
        assert_eq!(executor.execute(request()).await.unwrap(), json!("fast"));
    }

    #[test]
    fn empty_command_is_not_configured() {
        assert!(CommandStepExecutor::from_config(&AgentCommandConfig::default()).is_none());
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr() {
        let err = sh("cat > /dev/null; echo 'model overloaded' >&2; exit 3")
            .execute(request())
            .await
            .unwrap_err();
        assert!(matches!(&err, AgentError::Failed(msg) if msg.contains("model overloaded")));
    }

    #[tokio::test]
    async fn non_json_output_is_invalid_response() {
        let err = sh("cat > /dev/null; echo 'feature-x please'")
            .execute(request())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn request_larger_than_pipe_buffer_round_trips() {
        let blob = "x".repeat(1 << 20);
        let mut req = request();
        req.inputs = json!({ "blob": blob });

        let value = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            CommandStepExecutor::new("cat", Vec::new()).execute(req),
        )
        .await
        .expect("agent call should not stall on a large request")
        .unwrap();
        assert_eq!(value["inputs"]["blob"].as_str().map(str::len), Some(1 << 20));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let err = CommandStepExecutor::new("/nonexistent/stepwise-agent", Vec::new())
            .execute(request())
            .await
            .unwrap_err();
        assert!(matches!(&err, AgentError::Failed(msg) if msg.contains("Failed to spawn")));
    }
}
