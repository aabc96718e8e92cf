//! Hierarchy Error Types
//!
//! Every fallible operation in the crate returns [`Result`], an alias over
//! [`HierarchyError`]. The variants mirror the failure classes the engine
//! distinguishes:
//!
//! - **Invariant violations** (`Invariant`) abort the current request
//! - **Cancellation** (`Cancelled`) unwinds through savepoint rollback
//! - **Misconfiguration** (`Misconfiguration`) is caught at provider level and
//!   turned into an empty provider with a diagnostic
//! - **Storage failures** (`Database`, `SqlExecution`) surface to the caller

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, HierarchyError>;

/// Errors raised while building, caching or reading a hierarchy
#[derive(Error, Debug)]
pub enum HierarchyError {
    /// An internal invariant does not hold (missing parent node, inconsistent cache state)
    #[error("Invariant violated: {context}")]
    Invariant { context: String },

    /// The request was cancelled through its cancellation token
    #[error("Operation cancelled")]
    Cancelled,

    /// A rule or specification is missing a required attribute
    #[error("Misconfigured specification: {context}")]
    Misconfiguration { context: String },

    /// Raw SQLite failure
    #[error("Database operation failed: {0}")]
    Database(#[from] rusqlite::Error),

    /// SQL execution or row conversion failure with context
    #[error("SQL execution failed: {context}")]
    SqlExecution { context: String },

    /// JSON (de)serialization failure
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The expression evaluator rejected an expression
    #[error("Failed to evaluate '{expression}': {message}")]
    Expression { expression: String, message: String },

    /// A data source produced more rows than the request allows
    #[error("Result set too large: limit {limit}, got {actual}")]
    ResultSetTooLarge { limit: usize, actual: usize },

    /// Waiting for a hierarchy level lock exceeded the configured timeout
    #[error("Timed out waiting for hierarchy level {level} to unlock")]
    LockTimeout { level: Uuid },
}

impl HierarchyError {
    /// Create an invariant violation error
    pub fn invariant(context: impl Into<String>) -> Self {
        Self::Invariant {
            context: context.into(),
        }
    }

    /// Create a misconfiguration error
    pub fn misconfiguration(context: impl Into<String>) -> Self {
        Self::Misconfiguration {
            context: context.into(),
        }
    }

    /// Create a SQL execution error with context
    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecution {
            context: context.into(),
        }
    }

    /// Create an expression evaluation error
    pub fn expression(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<anyhow::Error> for HierarchyError {
    fn from(err: anyhow::Error) -> Self {
        Self::sql_execution(format!("{:#}", err))
    }
}
