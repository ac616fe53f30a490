//! Backend health check
//!
//! Verifies the credentials reach the backend and that every table the HR
//! portal needs is exposed.

use crate::error::RemoteFailure;
use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

pub const REQUIRED_TABLES: &[&str] = &[
    "users",
    "departments",
    "time_off_requests",
    "room_bookings",
    "public_holidays",
];

#[async_trait]
pub trait TableProbe: Send + Sync {
    /// Cheapest authenticated round trip
    async fn ping(&self) -> Result<(), RemoteFailure>;

    /// Succeeds when the table can be read
    async fn probe(&self, table: &str) -> Result<(), RemoteFailure>;
}

#[async_trait]
impl TableProbe for SupabaseClient {
    async fn ping(&self) -> Result<(), RemoteFailure> {
        self.select::<serde_json::Value>(REQUIRED_TABLES[0], &[("select", "id"), ("limit", "1")])
            .await
            .map(|_| ())
    }

    async fn probe(&self, table: &str) -> Result<(), RemoteFailure> {
        self.select::<serde_json::Value>(table, &[("select", "*"), ("limit", "0")])
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TableState {
    Present,
    Missing,
    Error(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub name: String,
    pub state: TableState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    pub tables: Vec<TableStatus>,
}

impl HealthReport {
    /// Connected and no required table missing; probe errors are reported but tolerated
    pub fn healthy(&self) -> bool {
        self.connected && self.tables.iter().all(|t| t.state != TableState::Missing)
    }

    pub fn missing(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.state == TableState::Missing)
            .map(|t| t.name.as_str())
            .collect()
    }
}

fn classify(result: Result<(), RemoteFailure>) -> TableState {
    match result {
        Ok(()) => TableState::Present,
        Err(e) if e.is_missing_relation() => TableState::Missing,
        Err(e) => TableState::Error(e.to_string()),
    }
}

/// Reaching the server counts as connected even if the probed table is missing
fn is_reachable(failure: &RemoteFailure) -> bool {
    failure.is_missing_relation()
}

pub async fn check(probe: &dyn TableProbe) -> HealthReport {
    info!("Verifying backend connection...");

    let (connected, connection_error) = match probe.ping().await {
        Ok(()) => (true, None),
        Err(e) if is_reachable(&e) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };

    if !connected {
        error!(
            "Error connecting to backend: {}",
            connection_error.as_deref().unwrap_or_default()
        );
        return HealthReport {
            connected,
            connection_error,
            tables: Vec::new(),
        };
    }
    info!("✅ Successfully connected");

    let mut tables = Vec::with_capacity(REQUIRED_TABLES.len());
    for table in REQUIRED_TABLES {
        tables.push(TableStatus {
            name: table.to_string(),
            state: classify(probe.probe(table).await),
        });
    }

    for status in &tables {
        match &status.state {
            TableState::Present => info!("   {:<20} present", status.name),
            TableState::Missing => warn!("   {:<20} MISSING", status.name),
            TableState::Error(e) => warn!("   {:<20} error: {}", status.name, e),
        }
    }

    HealthReport {
        connected,
        connection_error,
        tables,
    }
}
