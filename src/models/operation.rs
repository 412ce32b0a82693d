//! Operation DTOs exchanged with the orchestrator.
//!
//! - `Operation`: the unit of work, its status and its results
//! - `RepositoryStrategy`: how to reach the remote (ssh key or http credentials)
//! - `OperationSetup`: wire form of the requested action, validated into `Setup`
//! - `OperationLoadFiles`: file pattern and the path → content result set
//! - `RepositoryInfo`: facts about the remote recorded by checkouts
//!
//! Used by: intake routes (request/response bodies), the store (JSON column),
//! and the processor.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Processing,
    Done,
    Error,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationStatus::Done | OperationStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Done => "done",
            OperationStatus::Error => "error",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Ssh,
    #[default]
    Https,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryStrategy {
    pub connection_type: ConnectionType,
    pub ssh_key: String,
    pub ssh_key_content: String,
    pub user: String,
    pub password: String,
    pub default_branch: Option<String>,
}

impl RepositoryStrategy {
    /// Copy with credentials blanked, for API responses.
    pub fn redacted(&self) -> Self {
        let mut strategy = self.clone();
        if !strategy.ssh_key_content.is_empty() {
            strategy.ssh_key_content = "***".to_string();
        }
        if !strategy.password.is_empty() {
            strategy.password = "***".to_string();
        }
        strategy
    }
}

// Credentials must never reach the logs.
impl fmt::Debug for RepositoryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryStrategy")
            .field("connection_type", &self.connection_type)
            .field("ssh_key", &self.ssh_key)
            .field("user", &self.user)
            .field("default_branch", &self.default_branch)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckoutSetup {
    pub branch: String,
    pub tag: String,
    pub commit: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadFilesSetup {
    pub pattern: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSetup {
    pub branch: String,
    pub message: String,
}

/// Wire form of the requested action. Exactly one field is expected to be set;
/// `Setup::from_wire` enforces it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSetup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout: Option<CheckoutSetup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_files: Option<LoadFilesSetup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<PushSetup>,
}

/// The action an operation runs, one variant per executor pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Setup {
    Checkout(CheckoutSetup),
    LoadFiles(LoadFilesSetup),
    Push(PushSetup),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupError {
    Unrecognized,
    Ambiguous,
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetupError::Unrecognized => f.write_str("unrecognized setup"),
            SetupError::Ambiguous => f.write_str("ambiguous setup: more than one action requested"),
        }
    }
}

impl std::error::Error for SetupError {}

impl Setup {
    pub fn from_wire(setup: &OperationSetup) -> Result<Self, SetupError> {
        match (&setup.checkout, &setup.load_files, &setup.push) {
            (Some(checkout), None, None) => Ok(Setup::Checkout(checkout.clone())),
            (None, Some(load_files), None) => Ok(Setup::LoadFiles(load_files.clone())),
            (None, None, Some(push)) => Ok(Setup::Push(push.clone())),
            (None, None, None) => Err(SetupError::Unrecognized),
            _ => Err(SetupError::Ambiguous),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Setup::Checkout(_) => "checkout",
            Setup::LoadFiles(_) => "load_files",
            Setup::Push(_) => "push",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationLoadFiles {
    /// Loaded right after a checkout when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub results: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    pub fetch_url: String,
    pub default_branch: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(default)]
    pub uuid: String,
    pub url: String,
    #[serde(default)]
    pub repository_strategy: RepositoryStrategy,
    #[serde(default)]
    pub setup: OperationSetup,
    #[serde(default)]
    pub load_files: OperationLoadFiles,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_info: Option<RepositoryInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn succeed(&mut self) {
        self.status = OperationStatus::Done;
        self.error = None;
        self.date = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::Error;
        self.error = Some(message.into());
        self.date = Some(Utc::now());
    }

    /// Copy safe to hand back to API clients.
    pub fn redacted(&self) -> Self {
        let mut op = self.clone();
        op.repository_strategy = self.repository_strategy.redacted();
        op
    }
}

/// Request body of `POST /operations`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOperation {
    pub url: String,
    #[serde(default)]
    pub repository_strategy: RepositoryStrategy,
    #[serde(default)]
    pub setup: OperationSetup,
    #[serde(default)]
    pub load_files: OperationLoadFiles,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_requires_exactly_one_action() {
        let none = OperationSetup::default();
        assert_eq!(Setup::from_wire(&none), Err(SetupError::Unrecognized));
        assert_eq!(SetupError::Unrecognized.to_string(), "unrecognized setup");

        let both = OperationSetup {
            checkout: Some(CheckoutSetup::default()),
            push: Some(PushSetup::default()),
            ..Default::default()
        };
        assert_eq!(Setup::from_wire(&both), Err(SetupError::Ambiguous));

        let checkout = OperationSetup {
            checkout: Some(CheckoutSetup {
                branch: "main".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(matches!(
            Setup::from_wire(&checkout),
            Ok(Setup::Checkout(c)) if c.branch == "main"
        ));
    }

    #[test]
    fn operation_parses_orchestrator_payload() {
        let body = r#"{
            "url": "https://example.com/org/repo.git",
            "repository_strategy": {"connection_type": "ssh", "ssh_key_content": "KEY"},
            "setup": {"load_files": {"pattern": "*.yml"}}
        }"#;
        let op: Operation = serde_json::from_str(body).unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.repository_strategy.connection_type, ConnectionType::Ssh);
        assert!(matches!(
            Setup::from_wire(&op.setup),
            Ok(Setup::LoadFiles(l)) if l.pattern == "*.yml"
        ));
    }

    #[test]
    fn redaction_hides_credentials() {
        let op = Operation {
            repository_strategy: RepositoryStrategy {
                password: "hunter2".to_string(),
                ssh_key_content: "PRIVATE".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        let redacted = op.redacted();
        assert_eq!(redacted.repository_strategy.password, "***");
        assert_eq!(redacted.repository_strategy.ssh_key_content, "***");
        assert!(!format!("{:?}", op).contains("hunter2"));
    }

    #[test]
    fn terminal_transitions_set_date() {
        let mut op = Operation::default();
        op.fail("boom");
        assert_eq!(op.status, OperationStatus::Error);
        assert!(op.date.is_some());
        op.succeed();
        assert_eq!(op.error, None);
        assert!(op.status.is_terminal());
    }
}
