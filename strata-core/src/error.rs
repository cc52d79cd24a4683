use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        if let Some(position) = db_err.position() {
            msg.push_str(&format!("\n  Position: {:?}", position));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    msg
}

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid changelog: {0}")]
    InvalidChangelog(String),

    #[error("Invalid SQL in {source_name}: {reason}")]
    InvalidSql { source_name: String, reason: String },

    #[error("SQL execution failed during {phase} ({source_name}) for statement:\n{statement}\n  Reason: {reason}")]
    SqlExecution {
        phase: String,
        source_name: String,
        statement: String,
        reason: String,
    },

    #[error("Hook failed during {phase} ({hook}): {reason}")]
    HookFailed {
        phase: String,
        hook: String,
        reason: String,
    },

    #[error("Validation failed:\n{0}")]
    ValidationFailed(String),

    #[error("Migration state error: {0}")]
    MigrationState(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Placeholder '{key}' not found. Available parameters: {available}")]
    PlaceholderNotFound { key: String, available: String },

    #[error("Failed to acquire advisory lock: {0}")]
    LockError(String),
}

impl StrataError {
    /// Human-readable reason, unwrapping database errors to their detailed form.
    pub fn reason(&self) -> String {
        match self {
            StrataError::DatabaseError(db_err) => format_db_error(db_err),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
