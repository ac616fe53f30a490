//! Migration descriptors
//!
//! A descriptor is the declarative, versioned form of a policy
//! reconciliation: which table, which policy names to drop, which policies to
//! create. Built-in descriptors are embedded from `migrations/`.

use crate::migration::models::{is_identifier, PolicyCommand, PolicyDefinition, PolicySet, ProtectedTable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;
use validator::Validate;

/// Descriptors shipped with the binary, by name
const BUILTIN: &[(&str, &str)] = &[("users-rls", include_str!("../../migrations/users-rls.yaml"))];

#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Unknown built-in descriptor '{0}'")]
    UnknownBuiltin(String),

    #[error("Failed to read descriptor {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse descriptor: {0}")]
    Parse(String),

    #[error("Invalid descriptor: {0}")]
    Invalid(String),
}

/// Declarative reconciliation of one table's policy set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MigrationDescriptor {
    #[validate(length(min = 1, message = "Descriptor name is required"))]
    pub name: String,
    #[validate(range(min = 1, message = "Version starts at 1"))]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[validate(nested)]
    pub table: ProtectedTable,
    /// Policy names dropped before anything is created
    #[serde(default)]
    pub drop: Vec<String>,
    #[validate(nested)]
    #[serde(default)]
    pub create: Vec<PolicyDefinition>,
}

impl MigrationDescriptor {
    /// Look up a built-in descriptor by name
    pub fn builtin(name: &str) -> Result<Self, DescriptorError> {
        let (_, source) = BUILTIN
            .iter()
            .find(|(n, _)| *n == name)
            .ok_or_else(|| DescriptorError::UnknownBuiltin(name.to_string()))?;
        Self::from_yaml(source)
    }

    /// All built-in descriptors
    pub fn builtins() -> Result<Vec<Self>, DescriptorError> {
        BUILTIN.iter().map(|(_, source)| Self::from_yaml(source)).collect()
    }

    pub fn from_yaml(source: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self =
            serde_yaml::from_str(source).map_err(|e| DescriptorError::Parse(e.to_string()))?;
        descriptor.check()?;
        Ok(descriptor)
    }

    pub fn from_json(source: &str) -> Result<Self, DescriptorError> {
        let descriptor: Self =
            serde_json::from_str(source).map_err(|e| DescriptorError::Parse(e.to_string()))?;
        descriptor.check()?;
        Ok(descriptor)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file
    pub fn load_file(path: &Path) -> Result<Self, DescriptorError> {
        let source = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&source),
            _ => Self::from_yaml(&source),
        }
    }

    /// Field validation plus the rules that span fields
    pub fn check(&self) -> Result<(), DescriptorError> {
        self.validate()
            .map_err(|e| DescriptorError::Invalid(e.to_string()))?;

        for name in &self.drop {
            if name.is_empty() || name.chars().count() > 63 {
                return Err(DescriptorError::Invalid(format!(
                    "drop: policy name '{}' must be between 1 and 63 characters",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for policy in &self.create {
            if !seen.insert(policy.name.as_str()) {
                return Err(DescriptorError::Invalid(format!(
                    "create: policy '{}' is defined more than once",
                    policy.name
                )));
            }

            if let Some(role) = policy.roles.iter().find(|r| !is_identifier(r)) {
                return Err(DescriptorError::Invalid(format!(
                    "create: policy '{}' has invalid role '{}'",
                    policy.name, role
                )));
            }

            let (has_using, has_check) = (policy.using.is_some(), policy.with_check.is_some());
            let problem = match policy.command {
                PolicyCommand::Insert if has_using => Some("INSERT policies take WITH CHECK only"),
                PolicyCommand::Insert if !has_check => Some("INSERT policies need WITH CHECK"),
                PolicyCommand::Select | PolicyCommand::Delete if has_check => {
                    Some("SELECT and DELETE policies take USING only")
                }
                PolicyCommand::Select | PolicyCommand::Delete if !has_using => {
                    Some("SELECT and DELETE policies need USING")
                }
                PolicyCommand::Update | PolicyCommand::All if !has_using && !has_check => {
                    Some("policy needs USING or WITH CHECK")
                }
                _ => None,
            };
            if let Some(problem) = problem {
                return Err(DescriptorError::Invalid(format!(
                    "create: policy '{}': {}",
                    policy.name, problem
                )));
            }
        }

        Ok(())
    }

    /// The policy set the table should end up with
    pub fn intended(&self) -> PolicySet {
        PolicySet::new(self.table.clone(), self.create.iter().map(|p| p.name.clone()))
    }

    /// SHA-256 over the canonical JSON form
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }
}
