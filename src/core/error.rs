use crate::core::contract::ContractRule;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GovernanceError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Schema violation: {0}")]
    SchemaViolation(String),
    #[error("Contract violation [{}]: {message}", .rule.code())]
    ContractViolation { rule: ContractRule, message: String },
    #[error("Immutable history violation: {0}")]
    ImmutableHistoryViolation(String),
    #[error("Concurrency conflict: base version {expected} does not match current version {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },
    #[error("Encoding violation: {0}")]
    EncodingViolation(String),
    #[error("Deviation required: {0}")]
    DeviationRequired(String),
    #[error("Marker violation: {0}")]
    MarkerViolation(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl GovernanceError {
    pub fn contract(rule: ContractRule, message: impl Into<String>) -> Self {
        GovernanceError::ContractViolation {
            rule,
            message: message.into(),
        }
    }

    /// Stable machine-readable code for envelopes and audit lines.
    pub fn code(&self) -> &'static str {
        match self {
            GovernanceError::RusqliteError(_) => "STORAGE_ERROR",
            GovernanceError::IoError(_) => "IO_ERROR",
            GovernanceError::JsonError(_) => "JSON_ERROR",
            GovernanceError::ConfigError(_) => "CONFIG_ERROR",
            GovernanceError::SchemaViolation(_) => "SCHEMA_VIOLATION",
            GovernanceError::ContractViolation { .. } => "CONTRACT_VIOLATION",
            GovernanceError::ImmutableHistoryViolation(_) => "IMMUTABLE_HISTORY_VIOLATION",
            GovernanceError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            GovernanceError::EncodingViolation(_) => "ENCODING_VIOLATION",
            GovernanceError::DeviationRequired(_) => "DEVIATION_REQUIRED",
            GovernanceError::MarkerViolation(_) => "MARKER_VIOLATION",
            GovernanceError::ValidationError(_) => "VALIDATION_ERROR",
            GovernanceError::NotFound(_) => "NOT_FOUND",
        }
    }

    /// The violated rule, when the rejection came from a marker contract.
    pub fn rule(&self) -> Option<ContractRule> {
        match self {
            GovernanceError::ContractViolation { rule, .. } => Some(*rule),
            _ => None,
        }
    }

    /// True when the caller must revise ROUTE before the change can land.
    pub fn requires_route_revision(&self) -> bool {
        match self {
            GovernanceError::ContractViolation { rule, .. } => rule.requires_route_revision(),
            GovernanceError::DeviationRequired(_) => true,
            _ => false,
        }
    }

    /// Rejections leave the prior anchor authoritative; infrastructure
    /// failures are reported but are not governance decisions.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            GovernanceError::RusqliteError(_)
                | GovernanceError::IoError(_)
                | GovernanceError::JsonError(_)
                | GovernanceError::ConfigError(_)
        )
    }
}
