//! The Video Store: persistent record of every known video, its lifecycle
//! state, candidate VMAF measurements, and failure history.

pub mod models;
pub mod queries;
pub mod transitions;

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::StoreError;

pub use models::{DashboardStats, FailureKind, FailureStage, Library, Video, VideoState, Vmaf};

/// Opens (creating if absent) the SQLite database at `path` and runs pending migrations.
pub async fn connect(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);

    let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Retries a thunk against the database with exponential backoff when the
/// underlying driver reports the database is busy.
pub async fn with_busy_retry<T, F, Fut>(max_attempts: u32, base_delay_ms: u64, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Database(sqlx::Error::Database(ref db_err))) if is_busy(db_err.message()) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(StoreError::RetriesExhausted { attempts: attempt });
                }
                let delay = base_delay_ms * 2u64.pow(attempt.min(6));
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Err(other) => return Err(other),
        }
    }
}

fn is_busy(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_busy_messages() {
        assert!(is_busy("database is locked"));
        assert!(is_busy("SQLITE_BUSY: database is busy"));
        assert!(!is_busy("no such table: videos"));
    }
}
