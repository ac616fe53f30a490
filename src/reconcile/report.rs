//! Batch report
//!
//! Aggregates per-statement results of one run into a single summary.

use crate::executor::{ExecutionResult, Outcome};
use crate::migration::{MigrationDescriptor, PolicySet, StatementKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// How the run's overall success is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuccessCriterion {
    /// Only the final protection re-enable counts
    FinalEnable,
    /// Nothing may end as a warning or fatal outcome
    NoFailures,
}

/// Live policy names compared against the intended set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAudit {
    pub live: Vec<String>,
    /// Present but not intended
    pub stale: Vec<String>,
    /// Intended but not present
    pub missing: Vec<String>,
}

impl PolicyAudit {
    pub fn compare(live: &PolicySet, intended: &PolicySet) -> Self {
        Self {
            live: live.names.iter().cloned().collect(),
            stale: live.names.difference(&intended.names).cloned().collect(),
            missing: intended.names.difference(&live.names).cloned().collect(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.stale.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub run_id: Uuid,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    pub transport: String,
    pub atomic: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<ExecutionResult>,
    pub counts: BTreeMap<Outcome, usize>,
    pub drop_attempts: usize,
    pub create_attempts: usize,
    pub reached_done: bool,
    pub criterion: SuccessCriterion,
    pub overall_success: bool,
    /// Protection is back on but a replacement policy was not created
    pub incomplete_policy_set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<PolicyAudit>,
}

impl BatchReport {
    pub fn new(label: impl Into<String>, transport: &str, criterion: SuccessCriterion) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            label: label.into(),
            descriptor_version: None,
            fingerprint: None,
            transport: transport.to_string(),
            atomic: false,
            started_at: now,
            finished_at: now,
            results: Vec::new(),
            counts: BTreeMap::new(),
            drop_attempts: 0,
            create_attempts: 0,
            reached_done: false,
            criterion,
            overall_success: false,
            incomplete_policy_set: false,
            audit: None,
        }
    }

    pub fn for_descriptor(descriptor: &MigrationDescriptor, transport: &str) -> Self {
        let mut report = Self::new(&descriptor.name, transport, SuccessCriterion::FinalEnable);
        report.descriptor_version = Some(descriptor.version);
        report.fingerprint = Some(descriptor.fingerprint());
        report
    }

    pub fn record(&mut self, result: ExecutionResult) {
        *self.counts.entry(result.outcome).or_insert(0) += 1;
        match result.statement.kind {
            StatementKind::DropPolicy { .. } => self.drop_attempts += 1,
            StatementKind::CreatePolicy { .. } => self.create_attempts += 1,
            _ => {}
        }
        self.results.push(result);
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.counts.get(&outcome).copied().unwrap_or(0)
    }

    /// Close the run and derive the overall verdict
    pub fn finish(&mut self) {
        self.reached_done = true;
        self.finished_at = Utc::now();

        self.overall_success = match self.criterion {
            SuccessCriterion::FinalEnable => self.protection_restored(),
            SuccessCriterion::NoFailures => self.count(Outcome::Warning) == 0 && self.count(Outcome::Fatal) == 0,
        };

        let create_failed = self
            .results
            .iter()
            .any(|r| matches!(r.statement.kind, StatementKind::CreatePolicy { .. }) && !r.succeeded());
        let protection_on = self.protection_restored();
        self.incomplete_policy_set = create_failed && protection_on;
    }

    /// Whether the last re-enable statement went through
    fn protection_restored(&self) -> bool {
        self.results
            .iter()
            .rev()
            .find(|r| r.statement.kind == StatementKind::EnableProtection)
            .map_or(false, |r| r.succeeded())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExecutionResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }
}
