use sea_orm::error::DbErr;
use sea_orm::TransactionError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single failed field check, reported alongside its siblings so the
/// caller can surface every problem at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// One part of an allocation request that could not be admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub part_id: Uuid,
    pub available: i32,
    pub requested: i32,
}

fn join_violations(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {}", join_violations(.0))]
    Validation(Vec<FieldViolation>),

    #[error("Insufficient quantity on lot {lot_id}: balance {balance}, requested delta {delta}")]
    InsufficientQuantity {
        lot_id: Uuid,
        balance: i32,
        delta: i32,
    },

    #[error("Insufficient allocation for {} part(s)", .0.len())]
    InsufficientAllocation(Vec<Shortfall>),

    #[error("Invalid transition: {action} is not permitted in state {state}")]
    InvalidTransition { state: String, action: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl CoreError {
    /// Single-field validation failure.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation(vec![FieldViolation::new(field, message)])
    }

    /// True for business-rule outcomes that are safe to show to the end
    /// user; infrastructure failures stay generic.
    pub fn is_business_outcome(&self) -> bool {
        !matches!(
            self,
            CoreError::Database(_) | CoreError::Event(_) | CoreError::Config(_) | CoreError::Other(_)
        )
    }

    /// Message suitable for surfacing to the caller. Infrastructure
    /// failures are reduced to a generic line; details go to the log.
    pub fn surface_message(&self) -> String {
        if self.is_business_outcome() {
            self.to_string()
        } else {
            "Internal error".to_string()
        }
    }
}

impl From<validator::ValidationErrors> for CoreError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let violations = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |err| {
                    let message = err
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| err.code.to_string());
                    FieldViolation::new(field, message)
                })
            })
            .collect();
        CoreError::Validation(violations)
    }
}

impl From<TransactionError<CoreError>> for CoreError {
    fn from(err: TransactionError<CoreError>) -> Self {
        match err {
            TransactionError::Connection(db_err) => CoreError::Database(db_err),
            TransactionError::Transaction(core_err) => core_err,
        }
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl CoreError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        CoreError::Database(error.into_db_err())
    }
}
