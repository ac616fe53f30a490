//! Reconciliation driver
//!
//! Runs `Disabling → Dropping(n) → Creating(m) → Enabling → Done` against one
//! protected table. Every transition is unconditional: each statement is
//! attempted exactly once, in plan order, whatever happened before it.
//! There is no rollback. A failed create after successful drops leaves the
//! table protected with an incomplete policy set; the report flags it.

use crate::error::AppError;
use crate::executor::RemoteExecutor;
use crate::migration::{MigrationDescriptor, Phase, PolicySet, Statement, StatementKind, StatementSequencer};
use crate::reconcile::report::{BatchReport, PolicyAudit, SuccessCriterion};
use serde::Serialize;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    Disabling,
    /// Drops attempted so far
    Dropping(usize),
    /// Creates attempted so far
    Creating(usize),
    Enabling,
    Done,
}

impl DriverState {
    /// State after attempting a statement of `kind`
    pub fn advance(self, kind: &StatementKind) -> Self {
        match (self, kind) {
            (DriverState::Dropping(n), StatementKind::DropPolicy { .. }) => DriverState::Dropping(n + 1),
            (_, StatementKind::DropPolicy { .. }) => DriverState::Dropping(1),
            (DriverState::Creating(m), StatementKind::CreatePolicy { .. }) => DriverState::Creating(m + 1),
            (_, StatementKind::CreatePolicy { .. }) => DriverState::Creating(1),
            (_, StatementKind::DisableProtection) => DriverState::Disabling,
            (_, StatementKind::EnableProtection) => DriverState::Enabling,
            (state, StatementKind::ProvisionExec | StatementKind::Raw) => state,
        }
    }

    fn same_phase(&self, other: &DriverState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Whether running `kind` moves into a phase not yet announced.
    ///
    /// Statements outside the four phases never announce one.
    fn enters_phase(announced: Option<DriverState>, next: DriverState, kind: &StatementKind) -> bool {
        Phase::of(kind).is_some() && !announced.map_or(false, |a| a.same_phase(&next))
    }
}

impl fmt::Display for DriverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverState::Disabling => write!(f, "disabling protection"),
            DriverState::Dropping(_) => write!(f, "dropping policies"),
            DriverState::Creating(_) => write!(f, "creating policies"),
            DriverState::Enabling => write!(f, "re-enabling protection"),
            DriverState::Done => write!(f, "done"),
        }
    }
}

pub struct ReconciliationDriver<'a> {
    executor: &'a RemoteExecutor,
}

impl<'a> ReconciliationDriver<'a> {
    pub fn new(executor: &'a RemoteExecutor) -> Self {
        Self { executor }
    }

    /// Reconcile one table's policy set from a descriptor
    pub async fn reconcile(&self, descriptor: &MigrationDescriptor) -> BatchReport {
        info!(
            "🔐 Reconciling policies on {} ({} v{})",
            descriptor.table, descriptor.name, descriptor.version
        );

        let plan = StatementSequencer::plan(descriptor);
        let mut report = BatchReport::for_descriptor(descriptor, self.executor.transport().name());
        self.drive(&plan, &mut report).await;
        self.audit(descriptor, &mut report).await;
        Self::summarize(&report);
        report
    }

    /// Run a caller-ordered statement list through the same state machine
    pub async fn run_statements(
        &self,
        label: &str,
        statements: Vec<Statement>,
        criterion: SuccessCriterion,
    ) -> BatchReport {
        let plan = StatementSequencer::sequence(statements);
        let mut report = BatchReport::new(label, self.executor.transport().name(), criterion);
        self.drive(&plan, &mut report).await;
        Self::summarize(&report);
        report
    }

    /// Reconcile inside a single remote transaction.
    ///
    /// Refused before anything is sent when the transport has no transactions.
    pub async fn reconcile_atomic(&self, descriptor: &MigrationDescriptor) -> Result<BatchReport, AppError> {
        let transport = self.executor.transport();
        if !transport.supports_transactions() {
            return Err(AppError::Unsupported(format!(
                "the {} transport cannot run a reconciliation in one transaction; use --direct",
                transport.name()
            )));
        }

        info!(
            "🔐 Reconciling policies on {} ({} v{}) in one transaction",
            descriptor.table, descriptor.name, descriptor.version
        );

        let plan = StatementSequencer::plan(descriptor);
        let mut report = BatchReport::for_descriptor(descriptor, transport.name());
        report.atomic = true;
        for result in self.executor.execute_atomic(&plan).await {
            report.record(result);
        }
        report.finish();

        self.audit(descriptor, &mut report).await;
        Self::summarize(&report);
        Ok(report)
    }

    async fn drive(&self, plan: &[Statement], report: &mut BatchReport) {
        let mut state = DriverState::Disabling;
        let mut announced = None;

        for statement in plan {
            state = state.advance(&statement.kind);
            if DriverState::enters_phase(announced, state, &statement.kind) {
                info!("▶ Phase: {}", state);
                announced = Some(state);
            }

            let result = self.executor.execute(statement).await;
            report.record(result);
        }

        state = DriverState::Done;
        info!("▶ Phase: {}", state);
        report.finish();
    }

    async fn audit(&self, descriptor: &MigrationDescriptor, report: &mut BatchReport) {
        match self.executor.transport().list_policies(&descriptor.table).await {
            Ok(Some(live)) => {
                let live = PolicySet::new(descriptor.table.clone(), live);
                let audit = PolicyAudit::compare(&live, &descriptor.intended());
                if !audit.stale.is_empty() {
                    warn!("⚠️  Policies not in {}: {:?}", descriptor.name, audit.stale);
                }
                if !audit.missing.is_empty() {
                    warn!("⚠️  Intended policies missing: {:?}", audit.missing);
                }
                report.audit = Some(audit);
            }
            Ok(None) => {}
            Err(e) => warn!("⚠️  Could not read live policies on {}: {}", descriptor.table, e),
        }
    }

    fn summarize(report: &BatchReport) {
        for failure in report.failures() {
            if let Some(ref e) = failure.error {
                info!("   [{}] {:?}: {}", failure.index, failure.outcome, e);
            }
        }

        if report.incomplete_policy_set {
            warn!("⚠️  Protection is enabled but not every replacement policy was created; access may be locked");
        }

        if report.overall_success {
            info!("✅ {} completed ({} statements)", report.label, report.results.len());
        } else {
            error!("❌ {} did not complete successfully", report.label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::{FakePolicyStore, RecordingTransport};
    use crate::executor::Outcome;
    use crate::migration::{PolicyCommand, PolicyDefinition, ProtectedTable};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn users() -> ProtectedTable {
        ProtectedTable::new("public", "users")
    }

    fn select_policy(name: &str) -> PolicyDefinition {
        PolicyDefinition {
            name: name.to_string(),
            command: PolicyCommand::Select,
            roles: vec![],
            using: Some("true".to_string()),
            with_check: None,
        }
    }

    fn five_step_plan() -> Vec<Statement> {
        vec![
            Statement::disable(&users()),
            Statement::drop_policy(&users(), "A"),
            Statement::drop_policy(&users(), "B"),
            Statement::create_policy(&users(), &select_policy("A2")),
            Statement::enable(&users()),
        ]
    }

    #[test]
    fn test_state_transitions() {
        let mut state = DriverState::Disabling;
        let mut seen = Vec::new();
        for statement in five_step_plan() {
            state = state.advance(&statement.kind);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                DriverState::Disabling,
                DriverState::Dropping(1),
                DriverState::Dropping(2),
                DriverState::Creating(1),
                DriverState::Enabling,
            ]
        );
        assert_eq!(DriverState::Creating(3).advance(&StatementKind::Raw), DriverState::Creating(3));
    }

    fn announced_phases(plan: &[Statement]) -> Vec<DriverState> {
        let mut state = DriverState::Disabling;
        let mut announced = None;
        let mut seen = Vec::new();
        for statement in plan {
            state = state.advance(&statement.kind);
            if DriverState::enters_phase(announced, state, &statement.kind) {
                announced = Some(state);
                seen.push(state);
            }
        }
        seen
    }

    #[test]
    fn test_phase_announced_once_per_phase() {
        assert_eq!(
            announced_phases(&five_step_plan()),
            vec![
                DriverState::Disabling,
                DriverState::Dropping(1),
                DriverState::Creating(1),
                DriverState::Enabling,
            ]
        );
    }

    #[test]
    fn test_plain_script_announces_no_phase() {
        let script = StatementSequencer::split_script("SELECT 1;\nINSERT INTO departments (id, name) VALUES ('hr', 'HR');");
        assert!(announced_phases(&script).is_empty());

        let mixed = vec![Statement::raw("SELECT 1;"), Statement::drop_policy(&users(), "A")];
        assert_eq!(announced_phases(&mixed), vec![DriverState::Dropping(1)]);
    }

    #[tokio::test]
    async fn test_every_statement_sent_once_in_order_despite_failures() {
        let transport = Arc::new(RecordingTransport::failing_on(&["public.users"]));
        let executor = RemoteExecutor::new(transport.clone());
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let report = ReconciliationDriver::new(&executor).reconcile(&descriptor).await;

        let expected: Vec<String> = StatementSequencer::plan(&descriptor)
            .into_iter()
            .map(|s| s.text)
            .collect();
        assert_eq!(transport.calls(), expected);
        assert!(report.reached_done);
        assert!(!report.overall_success);
        assert_eq!(report.count(Outcome::Fatal), 1);
        assert_eq!(report.count(Outcome::BenignNoop), descriptor.drop.len() + descriptor.create.len());
        assert_eq!(report.results.iter().map(|r| r.index).collect::<Vec<_>>(), (1..=expected.len()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_drop_still_succeeds_overall() {
        let transport = Arc::new(RecordingTransport::failing_on(&["\"A\" ON"]));
        let executor = RemoteExecutor::new(transport.clone());

        let report = ReconciliationDriver::new(&executor)
            .run_statements("five-step", five_step_plan(), SuccessCriterion::FinalEnable)
            .await;

        assert_eq!(transport.calls().len(), 5);
        assert!(report.reached_done);
        assert!(report.overall_success);
        assert_eq!(report.results[1].outcome, Outcome::BenignNoop);
        assert_eq!(report.drop_attempts, 2);
        assert_eq!(report.create_attempts, 1);
        assert!(!report.incomplete_policy_set);
    }

    #[tokio::test]
    async fn test_overall_success_follows_enable_only() {
        let transport = Arc::new(RecordingTransport::failing_on(&["ENABLE ROW LEVEL SECURITY"]));
        let executor = RemoteExecutor::new(transport);

        let report = ReconciliationDriver::new(&executor)
            .run_statements("five-step", five_step_plan(), SuccessCriterion::FinalEnable)
            .await;

        assert!(report.reached_done);
        assert!(!report.overall_success);
        assert_eq!(report.results.last().unwrap().outcome, Outcome::Fatal);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let store = Arc::new(FakePolicyStore::with_policies(
            true,
            &["Admins have full access", "Users can view their own data"],
        ));
        let executor = RemoteExecutor::new(store.clone());
        let driver = ReconciliationDriver::new(&executor);
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let first = driver.reconcile(&descriptor).await;
        let after_first = store.snapshot();
        let second = driver.reconcile(&descriptor).await;

        assert!(first.overall_success);
        assert!(second.overall_success);
        assert_eq!(store.snapshot(), after_first);
        assert!(after_first.protected);
        assert_eq!(
            after_first.policies.into_iter().collect::<Vec<_>>(),
            vec!["Public read access", "Users insert own data", "Users update own data"]
        );
        assert_eq!(second.count(Outcome::Succeeded), second.results.len());
        assert!(second.audit.as_ref().unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_create_failure_leaves_table_locked_and_flags_it() {
        let store = Arc::new(FakePolicyStore {
            reject_create: Some("Users update own data".to_string()),
            ..FakePolicyStore::with_policies(true, &["Admins have full access"])
        });
        let executor = RemoteExecutor::new(store.clone());
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let report = ReconciliationDriver::new(&executor).reconcile(&descriptor).await;

        let state = store.snapshot();
        assert!(state.protected);
        assert!(!state.policies.contains("Users update own data"));
        assert!(!state.policies.contains("Admins have full access"));
        assert!(report.overall_success);
        assert!(report.incomplete_policy_set);
        assert_eq!(report.count(Outcome::Warning), 1);
        assert_eq!(report.audit.unwrap().missing, vec!["Users update own data"]);
    }

    #[tokio::test]
    async fn test_audit_reports_unknown_policies() {
        let store = Arc::new(FakePolicyStore::with_policies(true, &["Legacy rule"]));
        let executor = RemoteExecutor::new(store);
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let report = ReconciliationDriver::new(&executor).reconcile(&descriptor).await;

        assert!(report.overall_success);
        assert_eq!(report.audit.unwrap().stale, vec!["Legacy rule"]);
    }

    #[tokio::test]
    async fn test_atomic_refused_without_transactions() {
        let transport = Arc::new(RecordingTransport::default());
        let executor = RemoteExecutor::new(transport.clone());
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let err = ReconciliationDriver::new(&executor)
            .reconcile_atomic(&descriptor)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Unsupported(_)));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_atomic_failure_leaves_table_untouched() {
        let store = Arc::new(FakePolicyStore {
            reject_create: Some("Public read access".to_string()),
            transactional: true,
            ..FakePolicyStore::with_policies(true, &["Admins have full access"])
        });
        let before = store.snapshot();
        let executor = RemoteExecutor::new(store.clone());
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let report = ReconciliationDriver::new(&executor)
            .reconcile_atomic(&descriptor)
            .await
            .unwrap();

        assert!(report.atomic);
        assert!(!report.overall_success);
        assert_eq!(store.snapshot(), before);
    }

    #[tokio::test]
    async fn test_atomic_success() {
        let store = Arc::new(FakePolicyStore {
            transactional: true,
            ..FakePolicyStore::with_policies(false, &[])
        });
        let executor = RemoteExecutor::new(store.clone());
        let descriptor = MigrationDescriptor::builtin("users-rls").unwrap();

        let report = ReconciliationDriver::new(&executor)
            .reconcile_atomic(&descriptor)
            .await
            .unwrap();

        assert!(report.overall_success);
        assert!(store.snapshot().protected);
        assert_eq!(store.snapshot().policies.len(), 3);
    }
}
