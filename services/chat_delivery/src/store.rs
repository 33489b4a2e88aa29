use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::db;
use crate::error::{ChatError, ChatResult};

const OPEN: u8 = 0;
const COMMITTED: u8 = 1;
const EXPIRED: u8 = 2;

/// Async front for the SQLite pool.
///
/// Every operation runs on the blocking pool and is bounded by `timeout`.
/// Lock waits and pool checkout give up after half of it.
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    timeout: Duration,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P, timeout: Duration) -> ChatResult<Self> {
        let pool = db::open_pool(path, timeout / 2)?;
        Ok(Self { pool, timeout })
    }

    /// Run `op` against a pooled connection.
    ///
    /// A panicking task surfaces as `DeliveryFailed`, and so does a timeout
    /// that fires before anything was committed. Once the caller has been
    /// told the operation timed out, a commit attempted by `op` is turned
    /// into a rollback. If `op` had already committed when the timer fired,
    /// its real result is awaited and returned instead.
    pub async fn run<T, F>(&self, op: F) -> ChatResult<T>
    where
        F: FnOnce(&Connection) -> ChatResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let state = Arc::new(AtomicU8::new(OPEN));
        let hook_state = state.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            // returning true from the hook rolls the commit back
            conn.commit_hook(Some(move || {
                hook_state
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                        (s != EXPIRED).then_some(COMMITTED)
                    })
                    .is_err()
            }));
            let result = op(&conn);
            conn.commit_hook(None::<fn() -> bool>);
            result
        });
        let joined = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                let expired = state
                    .compare_exchange(OPEN, EXPIRED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if expired {
                    tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "store operation timed out");
                    return Err(ChatError::DeliveryFailed("store operation timed out".into()));
                }
                tracing::warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "store operation overran after committing"
                );
                task.await
            }
        };
        match joined {
            Ok(result) => result,
            Err(join) => {
                tracing::error!(error = %join, "store task aborted");
                Err(ChatError::DeliveryFailed("store task aborted".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_against_the_pool() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("chat.db"), Duration::from_secs(2)).unwrap();
        let tables: i64 = store
            .run(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(tables, 6);
    }

    #[tokio::test]
    async fn slow_operation_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("chat.db"), Duration::from_millis(50)).unwrap();
        let res = store
            .run(|_| {
                std::thread::sleep(std::time::Duration::from_millis(300));
                Ok(())
            })
            .await;
        match res {
            Err(e @ ChatError::DeliveryFailed(_)) => assert!(e.is_transient()),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timed_out_write_is_rolled_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("chat.db"), Duration::from_millis(50)).unwrap();
        let res = store
            .run(|conn| {
                std::thread::sleep(std::time::Duration::from_millis(200));
                crate::channels::create_channel(
                    conn,
                    &uuid::Uuid::new_v4(),
                    &uuid::Uuid::new_v4(),
                    "late",
                    crate::model::ChannelType::Group,
                )
            })
            .await;
        assert!(matches!(res, Err(ChatError::DeliveryFailed(_))));

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        let channels: i64 = store
            .run(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM channels", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(channels, 0);
    }

    #[tokio::test]
    async fn write_committed_before_the_deadline_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("chat.db"), Duration::from_millis(50)).unwrap();
        let res = store
            .run(|conn| {
                let channel = crate::channels::create_channel(
                    conn,
                    &uuid::Uuid::new_v4(),
                    &uuid::Uuid::new_v4(),
                    "kept",
                    crate::model::ChannelType::Group,
                )?;
                std::thread::sleep(std::time::Duration::from_millis(150));
                Ok(channel)
            })
            .await;
        assert_eq!(res.unwrap().name, "kept");
    }
}
