use thiserror::Error;

/// Partial unique index: at most one completed payment per order/membership.
pub const ONE_COMPLETED_PER_TARGET: &str = "payments_one_completed_per_target";

/// Unique index on `(method, gateway_transaction_id)`.
pub const ONE_PAYMENT_PER_TRANSACTION: &str = "payments_method_gateway_transaction_id_key";

#[derive(Debug, Clone, Error)]
pub enum DatabaseErrorKind {
    /// Pool exhausted, closed, or the connection dropped
    #[error("database unavailable: {message}")]
    Unavailable { message: String },

    #[error("{entity} with ID '{id}' not found")]
    NotFound { entity: String, id: String },

    #[error("unique constraint '{constraint}' violated")]
    UniqueViolation { constraint: String },

    /// A stored value no longer decodes into its domain type
    #[error("stored {entity} is unreadable: {message}")]
    Corrupt { entity: String, message: String },

    #[error("migration failed: {message}")]
    Migration { message: String },

    #[error("query failed: {message}")]
    Query { message: String },
}

pub type DbResult<T> = Result<T, DatabaseError>;

#[derive(Debug, Clone, Error)]
#[error("{kind}{}", .context.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub context: Option<String>,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind, context: None }
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::NotFound {
            entity: entity.into(),
            id: id.into(),
        })
    }

    pub fn corrupt(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Corrupt {
            entity: entity.into(),
            message: message.into(),
        })
    }

    pub fn unique_violation(constraint: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::UniqueViolation {
            constraint: constraint.into(),
        })
    }

    pub fn migration(message: impl ToString) -> Self {
        Self::new(DatabaseErrorKind::Migration {
            message: message.to_string(),
        })
    }

    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::Unavailable { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::NotFound { .. })
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    /// The write collided with another completed payment for the same target.
    pub fn is_duplicate_completion(&self) -> bool {
        matches!(
            &self.kind,
            DatabaseErrorKind::UniqueViolation { constraint } if constraint == ONE_COMPLETED_PER_TARGET
        )
    }

    #[cfg(feature = "database")]
    pub fn from_sqlx(error: sqlx::Error) -> Self {
        let kind = match error {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                DatabaseErrorKind::Unavailable {
                    message: error.to_string(),
                }
            }
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation
                Some("23505") => DatabaseErrorKind::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                _ => DatabaseErrorKind::Query {
                    message: db_err.message().to_string(),
                },
            },
            other => DatabaseErrorKind::Query {
                message: other.to_string(),
            },
        };
        Self::new(kind)
    }
}
