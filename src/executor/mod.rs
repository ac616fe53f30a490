//! Remote executor
//!
//! Sends one statement at a time through a [`Transport`] and turns the
//! answer into an [`ExecutionResult`]. A rejection is logged with the full
//! statement text and returned as data; it never stops the caller's batch.

mod direct;
mod rpc;

pub use direct::PostgresTransport;
pub use rpc::RpcTransport;

use crate::error::RemoteFailure;
use crate::migration::{Phase, ProtectedTable, Statement, StatementKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A way of getting one statement to the remote store
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one statement. The store applies it atomically or not at all.
    async fn execute(&self, sql: &str) -> Result<(), RemoteFailure>;

    fn supports_transactions(&self) -> bool {
        false
    }

    /// Run all statements inside one transaction
    async fn execute_atomic(&self, _statements: &[Statement]) -> Result<(), RemoteFailure> {
        Err(RemoteFailure::new(
            Some("UNSUPPORTED".to_string()),
            format!("{} transport cannot run transactions", self.name()),
        ))
    }

    /// Live policy names on a table, when the transport can read them
    async fn list_policies(&self, _table: &ProtectedTable) -> Result<Option<Vec<String>>, RemoteFailure> {
        Ok(None)
    }
}

/// Per-statement outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Rejected, but the intended end state holds anyway (dropping an absent rule)
    BenignNoop,
    Warning,
    Fatal,
}

impl Outcome {
    /// Classify a statement's answer
    pub fn classify(kind: &StatementKind, result: &Result<(), RemoteFailure>) -> Self {
        match (kind, result) {
            (_, Ok(())) => Outcome::Succeeded,
            (StatementKind::DropPolicy { .. }, Err(_)) => Outcome::BenignNoop,
            (StatementKind::EnableProtection, Err(_)) => Outcome::Fatal,
            (_, Err(_)) => Outcome::Warning,
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Succeeded)
    }
}

/// Outcome of running one statement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Position in dispatch order, starting at 1
    pub index: usize,
    pub phase: Option<Phase>,
    pub statement: Statement,
    pub outcome: Outcome,
    pub error: Option<RemoteFailure>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Succeeded
    }
}

/// Executes statements one at a time, never raising
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    dispatched: AtomicUsize,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            dispatched: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Number of statements sent so far
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::SeqCst)
    }

    /// Send one statement exactly once
    pub async fn execute(&self, statement: &Statement) -> ExecutionResult {
        let index = self.dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Executing [{}]: {}", index, statement.text);

        let started = Instant::now();
        let result = self.transport.execute(&statement.text).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = Outcome::classify(&statement.kind, &result);
        let error = result.err();
        Self::log(index, statement, outcome, error.as_ref());

        ExecutionResult {
            index,
            phase: statement.phase(),
            statement: statement.clone(),
            outcome,
            error,
            duration_ms,
        }
    }

    /// Send a whole plan as one transaction; every statement shares the outcome
    pub async fn execute_atomic(&self, statements: &[Statement]) -> Vec<ExecutionResult> {
        let first = self.dispatched.fetch_add(statements.len(), Ordering::SeqCst) + 1;
        info!("Executing {} statements in one transaction", statements.len());

        let started = Instant::now();
        let result = self.transport.execute_atomic(statements).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (outcome, error) = match result {
            Ok(()) => {
                info!("✅ Transaction committed");
                (Outcome::Succeeded, None)
            }
            Err(e) => {
                error!("❌ Transaction rolled back: {}", e);
                (Outcome::Fatal, Some(e))
            }
        };

        statements
            .iter()
            .enumerate()
            .map(|(offset, statement)| ExecutionResult {
                index: first + offset,
                phase: statement.phase(),
                statement: statement.clone(),
                outcome,
                error: error.clone(),
                duration_ms,
            })
            .collect()
    }

    fn log(index: usize, statement: &Statement, outcome: Outcome, error: Option<&RemoteFailure>) {
        let reason = error.map(|e| e.to_string()).unwrap_or_default();
        match outcome {
            Outcome::Succeeded => debug!("Successfully executed [{}]", index),
            Outcome::BenignNoop => info!("Skipped [{}] (nothing to drop): {}", index, reason),
            Outcome::Warning => warn!(statement = %statement.text, "⚠️  Statement [{}] failed: {}", index, reason),
            Outcome::Fatal => error!(statement = %statement.text, "❌ Statement [{}] failed: {}", index, reason),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory transports for tests

    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// Records every call; fails statements containing any configured needle
    #[derive(Default)]
    pub struct RecordingTransport {
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Vec<String>,
    }

    impl RecordingTransport {
        pub fn failing_on(needles: &[&str]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: needles.iter().map(|s| s.to_string()).collect(),
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn execute(&self, sql: &str) -> Result<(), RemoteFailure> {
            self.calls.lock().unwrap().push(sql.to_string());
            if self.fail_on.iter().any(|n| sql.contains(n.as_str())) {
                Err(RemoteFailure::new(Some("P0001".to_string()), "rejected"))
            } else {
                Ok(())
            }
        }
    }

    /// A single table's protection flag and policy names
    #[derive(Debug, Default, Clone, PartialEq, Eq)]
    pub struct TableState {
        pub protected: bool,
        pub policies: BTreeSet<String>,
    }

    /// Interprets reconciliation statements against one in-memory table
    #[derive(Default)]
    pub struct FakePolicyStore {
        pub state: Mutex<TableState>,
        pub reject_create: Option<String>,
        pub transactional: bool,
    }

    impl FakePolicyStore {
        pub fn with_policies(protected: bool, names: &[&str]) -> Self {
            Self {
                state: Mutex::new(TableState {
                    protected,
                    policies: names.iter().map(|s| s.to_string()).collect(),
                }),
                ..Default::default()
            }
        }

        pub fn snapshot(&self) -> TableState {
            self.state.lock().unwrap().clone()
        }

        fn apply(&self, state: &mut TableState, sql: &str) -> Result<(), RemoteFailure> {
            match StatementKind::classify(sql) {
                StatementKind::DisableProtection => state.protected = false,
                StatementKind::EnableProtection => state.protected = true,
                StatementKind::DropPolicy { name } => {
                    if !state.policies.remove(&name) && !sql.to_uppercase().contains("IF EXISTS") {
                        return Err(RemoteFailure::new(
                            Some("42704".to_string()),
                            format!("policy \"{}\" does not exist", name),
                        ));
                    }
                }
                StatementKind::CreatePolicy { name } => {
                    if self.reject_create.as_deref() == Some(name.as_str()) {
                        return Err(RemoteFailure::new(Some("42601".to_string()), "syntax error"));
                    }
                    if !state.policies.insert(name.clone()) {
                        return Err(RemoteFailure::new(
                            Some("42710".to_string()),
                            format!("policy \"{}\" already exists", name),
                        ));
                    }
                }
                StatementKind::ProvisionExec | StatementKind::Raw => {}
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Transport for FakePolicyStore {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn execute(&self, sql: &str) -> Result<(), RemoteFailure> {
            let mut state = self.state.lock().unwrap();
            self.apply(&mut state, sql)
        }

        fn supports_transactions(&self) -> bool {
            self.transactional
        }

        async fn execute_atomic(&self, statements: &[Statement]) -> Result<(), RemoteFailure> {
            let mut state = self.state.lock().unwrap();
            let mut working = state.clone();
            for statement in statements {
                self.apply(&mut working, &statement.text)?;
            }
            *state = working;
            Ok(())
        }

        async fn list_policies(&self, _table: &ProtectedTable) -> Result<Option<Vec<String>>, RemoteFailure> {
            Ok(Some(self.snapshot().policies.into_iter().collect()))
        }
    }
}
