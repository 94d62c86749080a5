//! Artifact runner
//!
//! Hands an artifact to the configured interpreter (`bash -c` by default) and
//! collects its output, bounded by a timeout. The child is killed when the
//! timeout fires.

use crate::config::ExecutionSettings;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Outcome of one artifact run
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: Vec<String>,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(interpreter: Vec<String>, timeout: Duration) -> Self {
        Self { interpreter, timeout }
    }

    pub fn from_settings(settings: &ExecutionSettings) -> Self {
        Self::new(settings.interpreter.clone(), Duration::from_secs(settings.timeout_secs))
    }

    /// Run `script`; spawn failures and timeouts become a failed outcome
    pub async fn run(&self, script: &str) -> RunOutcome {
        let start_time = Instant::now();
        debug!("running artifact with {:?} (timeout: {:?})", self.interpreter, self.timeout);

        let result = self.run_interpreter(script).await;
        let execution_time_ms = start_time.elapsed().as_millis();

        match result {
            Ok((output, exit_code)) => RunOutcome {
                success: exit_code == 0,
                output,
                error: None,
                exit_code: Some(exit_code),
                execution_time_ms,
            },
            Err(e) => RunOutcome {
                success: false,
                output: String::new(),
                error: Some(format!("{:#}", e)),
                exit_code: None,
                execution_time_ms,
            },
        }
    }

    async fn run_interpreter(&self, script: &str) -> Result<(String, i32)> {
        let (program, args) = self
            .interpreter
            .split_first()
            .ok_or_else(|| anyhow!("no interpreter configured"))?;

        let child = AsyncCommand::new(program)
            .args(args)
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start {}", program))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow!("Command timed out after {:?}", self.timeout))?
            .context("Failed to execute command")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined_output = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nSTDERR:\n{}", stdout, stderr)
        };

        Ok((combined_output, output.status.code().unwrap_or(-1)))
    }
}
