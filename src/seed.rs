//! Department seeding
//!
//! Fills the `departments` reference table with the default list, but only
//! when it is empty. Rows are inserted one at a time so one rejected row
//! does not block the rest.

use crate::error::{AppError, RemoteFailure};
use crate::supabase::SupabaseClient;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

const TABLE: &str = "departments";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: String,
    pub name: String,
}

impl Department {
    fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

pub fn default_departments() -> Vec<Department> {
    vec![
        Department::new("env-eng", "Environmental Engineering"),
        Department::new("green-bldg", "Green Building"),
        Department::new("carbon", "Carbon"),
        Department::new("esg", "ESG"),
        Department::new("hr", "HR"),
        Department::new("it", "IT"),
        Department::new("finance", "Finance"),
        Department::new("marketing", "Marketing"),
        Department::new("operations", "Operations"),
    ]
}

/// Where departments live
#[async_trait]
pub trait DepartmentStore: Send + Sync {
    async fn has_any(&self) -> Result<bool, RemoteFailure>;
    async fn add(&self, department: &Department) -> Result<(), RemoteFailure>;
    async fn list(&self) -> Result<Vec<Department>, RemoteFailure>;
}

#[async_trait]
impl DepartmentStore for SupabaseClient {
    async fn has_any(&self) -> Result<bool, RemoteFailure> {
        let rows: Vec<serde_json::Value> = self.select(TABLE, &[("select", "id"), ("limit", "1")]).await?;
        Ok(!rows.is_empty())
    }

    async fn add(&self, department: &Department) -> Result<(), RemoteFailure> {
        self.insert(TABLE, department).await
    }

    async fn list(&self) -> Result<Vec<Department>, RemoteFailure> {
        self.select(TABLE, &[("select", "id,name"), ("order", "name")]).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedReport {
    pub skipped: bool,
    pub inserted: Vec<String>,
    pub failed: Vec<(String, RemoteFailure)>,
    pub departments: Vec<Department>,
}

pub async fn seed_departments(store: &dyn DepartmentStore) -> Result<SeedReport, AppError> {
    info!("Checking existing departments...");
    let exists = store.has_any().await.map_err(AppError::Remote)?;

    let mut report = SeedReport {
        skipped: exists,
        inserted: Vec::new(),
        failed: Vec::new(),
        departments: Vec::new(),
    };

    if exists {
        info!("Departments already exist in the database. Skipping seeding.");
    } else {
        info!("No departments found. Adding default departments...");
        for department in default_departments() {
            match store.add(&department).await {
                Ok(()) => {
                    info!("Added department: {}", department.name);
                    report.inserted.push(department.id);
                }
                Err(e) => {
                    error!("Error adding department {}: {}", department.name, e);
                    report.failed.push((department.id, e));
                }
            }
        }
    }

    report.departments = store.list().await.map_err(AppError::Remote)?;
    for department in &report.departments {
        info!("   {:<12} {}", department.id, department.name);
    }

    Ok(report)
}
