use ragline_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("invalid sqlite url: {0}")]
    InvalidUrl(#[source] sqlx::Error),
    #[error("failed to connect to sqlite: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("failed to create checkpoint schema: {0}")]
    Migration(#[source] sqlx::Error),
}

/// Connectivity failures are transient; everything else is a backend fault.
pub(crate) fn store_error(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(error.to_string()),
        sqlx::Error::Database(ref db) if is_busy(db.code().as_deref()) => {
            StoreError::Unavailable(error.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_busy(code: Option<&str>) -> bool {
    matches!(
        code.and_then(|code| code.parse::<i32>().ok()).map(|code| code & 0xff),
        Some(5) | Some(6)
    )
}
