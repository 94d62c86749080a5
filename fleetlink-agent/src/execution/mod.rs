//! Execution dispatch
//!
//! Ledger-backed execution of artifacts pushed by the controller:
//! - Every artifact is recorded in the `ExecutionLedger` before it runs
//! - Status moves `Pending -> Running -> Succeeded | Failed`, persisted after each change
//! - Records left `Pending` or `Running` by a restart are picked up again at startup
//! - Outcomes are queued as heartbeat events

pub mod runner;

use crate::ledger::{ExecutionLedger, LedgerError};
use crate::models::EventInfo;
use crate::ports::{DispatchManager, ExecutionInfo};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use runner::ScriptRunner;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Directive under which executions are delivered
pub const EXECUTION_DIRECTIVE: &str = "execution";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "Pending",
            ExecutionState::Running => "Running",
            ExecutionState::Succeeded => "Succeeded",
            ExecutionState::Failed => "Failed",
        }
    }

    /// States a restart interrupts
    pub fn is_unfinished(status: &str) -> bool {
        status == ExecutionState::Pending.as_str() || status == ExecutionState::Running.as_str()
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `execution` directive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub name: String,
    pub content: String,
    /// Forget the record for `content` instead of running it
    #[serde(default)]
    pub revoke: bool,
}

/// Result of `ExecutionManager::dispatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Started,
    AlreadyKnown,
}

struct Inner {
    ledger: Arc<ExecutionLedger>,
    runner: ScriptRunner,
    events: Mutex<Vec<EventInfo>>,
    in_flight: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct ExecutionManager {
    inner: Arc<Inner>,
}

impl ExecutionManager {
    pub fn new(ledger: Arc<ExecutionLedger>, runner: ScriptRunner) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                ledger,
                runner,
                events: Mutex::new(Vec::new()),
                in_flight,
            }),
        }
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.inner.ledger
    }

    /// Number of runs that have not finished yet
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Record `content` under `name` and run it in the background.
    /// A name already present in the ledger is never run twice.
    pub fn dispatch(&self, name: &str, content: &[u8]) -> Result<DispatchOutcome, LedgerError> {
        if self.inner.ledger.exists(name) {
            info!("execution {} already known, skipping", name);
            return Ok(DispatchOutcome::AlreadyKnown);
        }

        self.inner
            .ledger
            .add(name, content, Utc::now(), ExecutionState::Pending.as_str())?;
        self.spawn_run(name.to_string(), content.to_vec());
        Ok(DispatchOutcome::Started)
    }

    /// Re-run every record a restart left unfinished. Returns how many were started.
    /// A record whose artifact cannot be read back is marked `Failed` and skipped.
    pub fn execute_pending(&self) -> usize {
        let mut started = 0;
        for record in self.inner.ledger.records() {
            if !ExecutionState::is_unfinished(&record.status) {
                continue;
            }
            let content = match std::fs::read(&record.storage_path) {
                Ok(content) => content,
                Err(e) => {
                    error!(
                        "cannot read artifact of {} at {}: {}",
                        record.name,
                        record.storage_path.display(),
                        e
                    );
                    self.inner.set_status(&record.name, ExecutionState::Failed);
                    self.inner.events.lock().push(EventInfo::warn(
                        "ExecutionFailed",
                        format!("execution {} cannot be resumed: {}", record.name, e),
                    ));
                    continue;
                }
            };
            info!("resuming execution {} (was {})", record.name, record.status);
            self.spawn_run(record.name, content);
            started += 1;
        }
        started
    }

    /// Forget the record holding `content`
    pub fn revoke(&self, content: &[u8]) -> Result<(), LedgerError> {
        self.inner.ledger.remove(content)
    }

    /// Apply an `execution` directive
    pub fn handle_request(&self, request: ExecutionRequest) -> Result<()> {
        if request.revoke {
            info!("revoking execution {}", request.name);
            self.revoke(request.content.as_bytes())?;
        } else {
            self.dispatch(&request.name, request.content.as_bytes())?;
        }
        Ok(())
    }

    fn spawn_run(&self, name: String, content: Vec<u8>) {
        self.inner.in_flight.send_modify(|n| *n += 1);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(&name, &content).await;
            inner.in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }
}

impl Inner {
    async fn run(&self, name: &str, content: &[u8]) {
        self.set_status(name, ExecutionState::Running);

        let script = String::from_utf8_lossy(content);
        let outcome = self.runner.run(&script).await;
        debug!("execution {} output:\n{}", name, outcome.output);

        if outcome.success {
            info!("execution {} succeeded in {}ms", name, outcome.execution_time_ms);
            self.set_status(name, ExecutionState::Succeeded);
            self.events.lock().push(EventInfo::info(
                "ExecutionSucceeded",
                format!("execution {} finished successfully", name),
            ));
        } else {
            let detail = outcome
                .error
                .unwrap_or_else(|| format!("exit code {}", outcome.exit_code.unwrap_or(-1)));
            warn!("execution {} failed: {}", name, detail);
            self.set_status(name, ExecutionState::Failed);
            self.events.lock().push(EventInfo::warn(
                "ExecutionFailed",
                format!("execution {} failed: {}", name, detail),
            ));
        }
    }

    fn set_status(&self, name: &str, state: ExecutionState) {
        let result = self
            .ledger
            .update_status(name, state.as_str())
            .and_then(|pending| pending.persist());
        if let Err(e) = result {
            // revoked while running, or the disk is gone; the run itself goes on
            error!("cannot record status {} for execution {}: {}", state, name, e);
        }
    }
}

#[async_trait]
impl DispatchManager for ExecutionManager {
    fn list(&self) -> Vec<ExecutionInfo> {
        let mut executions: Vec<ExecutionInfo> = self
            .inner
            .ledger
            .get_all_names_status()
            .into_iter()
            .map(|(name, status)| ExecutionInfo { name, status })
            .collect();
        executions.sort_by(|a, b| a.name.cmp(&b.name));
        executions
    }

    fn pop_events(&self) -> Vec<EventInfo> {
        std::mem::take(&mut *self.inner.events.lock())
    }

    async fn wait_for_completion(&self) {
        let mut rx = self.inner.in_flight.subscribe();
        // the sender lives in `inner`, so this only ends once the count is zero
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> ExecutionManager {
        let ledger = Arc::new(ExecutionLedger::open(dir.path()).unwrap());
        ExecutionManager::new(
            ledger,
            ScriptRunner::new(vec!["bash".into(), "-c".into()], Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_dispatch_runs_to_success() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let outcome = manager.dispatch("setup", b"echo configured").unwrap();
        assert_eq!(outcome, DispatchOutcome::Started);
        manager.wait_for_completion().await;

        assert_eq!(manager.ledger().get_status("setup").as_deref(), Some("Succeeded"));
        assert!(!manager.ledger().has_unpersisted_changes());
        let events = manager.pop_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reason, "ExecutionSucceeded");
        assert!(manager.pop_events().is_empty());
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.dispatch("broken", b"exit 7").unwrap();
        manager.wait_for_completion().await;

        assert_eq!(manager.ledger().get_status("broken").as_deref(), Some("Failed"));
        assert_eq!(manager.pop_events()[0].reason, "ExecutionFailed");
    }

    #[tokio::test]
    async fn test_duplicate_name_is_skipped() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.dispatch("once", b"true").unwrap();
        manager.wait_for_completion().await;
        let again = manager.dispatch("once", b"echo different").unwrap();

        assert_eq!(again, DispatchOutcome::AlreadyKnown);
        assert_eq!(manager.ledger().size(), 1);
    }

    #[tokio::test]
    async fn test_execute_pending_resumes_interrupted_runs() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = ExecutionLedger::open(dir.path()).unwrap();
            ledger.add("interrupted", b"true", Utc::now(), "Running").unwrap();
            ledger.add("queued", b"echo queued", Utc::now(), "Pending").unwrap();
            ledger.add("done", b"echo done", Utc::now(), "Succeeded").unwrap();
        }

        let manager = manager(&dir);
        assert_eq!(manager.execute_pending(), 2);
        manager.wait_for_completion().await;

        let statuses = manager.ledger().get_all_names_status();
        assert_eq!(statuses["interrupted"], "Succeeded");
        assert_eq!(statuses["queued"], "Succeeded");
        assert_eq!(statuses["done"], "Succeeded");
        assert_eq!(manager.pop_events().len(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_artifact_does_not_block_resume() {
        let dir = TempDir::new().unwrap();
        {
            let ledger = ExecutionLedger::open(dir.path()).unwrap();
            ledger.add("a-missing", b"echo gone", Utc::now(), "Pending").unwrap();
            ledger.add("b-fine", b"echo fine", Utc::now(), "Pending").unwrap();
            std::fs::remove_file(ledger.artifact_path(b"echo gone")).unwrap();
        }

        let manager = manager(&dir);
        assert_eq!(manager.execute_pending(), 1);
        manager.wait_for_completion().await;

        assert_eq!(manager.ledger().get_status("a-missing").as_deref(), Some("Failed"));
        assert_eq!(manager.ledger().get_status("b-fine").as_deref(), Some("Succeeded"));
        assert!(!manager.ledger().has_unpersisted_changes());

        let reasons: Vec<String> = manager.pop_events().into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, ["ExecutionFailed", "ExecutionSucceeded"]);

        let reloaded = ExecutionLedger::open(dir.path()).unwrap();
        assert_eq!(reloaded.get_status("a-missing").as_deref(), Some("Failed"));
    }

    #[tokio::test]
    async fn test_wait_for_completion_blocks_on_in_flight() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.dispatch("slow", b"sleep 1").unwrap();
        assert_eq!(manager.in_flight(), 1);
        manager.wait_for_completion().await;
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(manager.ledger().get_status("slow").as_deref(), Some("Succeeded"));
    }

    #[tokio::test]
    async fn test_revoke_forgets_record() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        manager.dispatch("temp", b"true").unwrap();
        manager.wait_for_completion().await;
        manager
            .handle_request(ExecutionRequest {
                name: "temp".into(),
                content: "true".into(),
                revoke: true,
            })
            .unwrap();

        assert!(!manager.ledger().exists("temp"));
        assert!(manager.list().is_empty());
    }
}
