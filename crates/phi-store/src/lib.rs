//! Restricted PHI datastore access. Only the PHI broker links this crate.

pub mod pool;
pub mod repository;

pub use pool::{PhiDbConfig, PhiPool};
pub use repository::PhiRepository;

/// Store failures. None of these carry driver messages, which can echo
/// column values back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhiStoreError {
    #[error("phi store unavailable")]
    Unavailable,
    #[error("phi store operation timed out")]
    Timeout,
    #[error("phi store query failed ({kind})")]
    Query { kind: &'static str },
    #[error("invalid value for field {field}")]
    InvalidValue { field: &'static str },
}

impl From<sqlx::Error> for PhiStoreError {
    fn from(value: sqlx::Error) -> Self {
        let kind = match value {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                return PhiStoreError::Unavailable;
            }
            sqlx::Error::Database(_) => "database",
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => "io",
            sqlx::Error::RowNotFound => "row_not_found",
            sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => "decode",
            sqlx::Error::Protocol(_) => "protocol",
            _ => "other",
        };
        PhiStoreError::Query { kind }
    }
}

impl From<sqlx::migrate::MigrateError> for PhiStoreError {
    fn from(_: sqlx::migrate::MigrateError) -> Self {
        PhiStoreError::Query { kind: "migrate" }
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), PhiStoreError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
