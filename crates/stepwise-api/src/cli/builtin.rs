//! Handlers available to every workflow run from the CLI.
//!
//! - `echo` returns its inputs unchanged
//! - `shell` runs `inputs.command` with `sh -c` and captures its output

use std::process::Stdio;

use serde_json::{Value, json};
use stepwise_core::workflow::handler::{FnHandler, HandlerError, HandlerInput, HandlerRegistry};

/// Registry with the built-in actions.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(
        "echo",
        FnHandler::new(|input: HandlerInput| async move { Ok::<_, HandlerError>(input.inputs) })
            .with_intent("Return the given inputs unchanged"),
    );
    registry.register(
        "shell",
        FnHandler::new(run_shell)
            .with_intent("Run the given shell command and report its stdout, stderr and exit code"),
    );
    registry
}

async fn run_shell(input: HandlerInput) -> Result<Value, HandlerError> {
    let command = input
        .inputs
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::InvalidInput("`command` must be a string".to_string()))?;

    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = input.inputs.get("cwd").and_then(Value::as_str) {
        cmd.current_dir(dir);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| HandlerError::Failed(format!("failed to run `{command}`: {e}")))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
    if !output.status.success() {
        return Err(HandlerError::Failed(format!(
            "`{command}` exited with status {}: {stderr}",
            output.status
        )));
    }

    tracing::debug!(step = %input.step, command, "shell command finished");
    Ok(json!({
        "stdout": stdout,
        "stderr": stderr,
        "exit_code": output.status.code(),
    }))
}
