//! Subprocess [`StageRunner`] driven by the `[stages]` config table.
//!
//! Each stage is a command line. The resolved step inputs are passed in the
//! `STEPWISE_INPUTS` environment variable as JSON; a zero exit status means
//! the stage passed. The tail of the command's output becomes the report
//! detail.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_core::workflow::collaborator::{StageError, StageReport, StageRunner};

/// Environment variable carrying the step's resolved inputs.
pub const INPUTS_ENV: &str = "STEPWISE_INPUTS";

/// Lines of output kept in a stage report.
const DETAIL_LINES: usize = 20;

/// Runs validation stages as configured commands.
#[derive(Debug, Clone, Default)]
pub struct CommandStageRunner {
    stages: BTreeMap<String, Vec<String>>,
    working_dir: Option<PathBuf>,
}

impl CommandStageRunner {
    pub fn new(stages: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            stages,
            working_dir: None,
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    async fn run_command(
        &self,
        stage: &str,
        command: &[String],
        inputs: &Value,
    ) -> anyhow::Result<StageReport> {
        let (program, args) = command
            .split_first()
            .with_context(|| format!("stage '{stage}' has an empty command"))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .env(INPUTS_ENV, inputs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to run '{program}'"))?;

        let passed = output.status.success();
        let detail = if passed {
            String::new()
        } else {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            format!("exit status {}\n{}", output.status, tail(&text, DETAIL_LINES))
                .trim_end()
                .to_string()
        };

        tracing::debug!(stage, passed, "validation stage finished");
        Ok(StageReport {
            stage: stage.to_string(),
            passed,
            detail,
        })
    }
}

impl StageRunner for CommandStageRunner {
    fn run_stage<'a>(
        &'a self,
        stage: &'a str,
        inputs: &'a Value,
    ) -> BoxFuture<'a, Result<StageReport, StageError>> {
        Box::pin(async move {
            let command = self
                .stages
                .get(stage)
                .ok_or_else(|| StageError::UnknownStage(stage.to_string()))?;
            self.run_command(stage, command, inputs)
                .await
                .map_err(|e| StageError::Failed {
                    stage: stage.to_string(),
                    reason: format!("{e:#}"),
                })
        })
    }
}

/// Last `lines` lines of `text`.
fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
