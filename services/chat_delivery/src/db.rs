use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ChatResult;

/// Open a single connection and apply the schema. Used by tests and tooling.
pub fn init_db<P: AsRef<Path>>(path: P) -> ChatResult<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn, Duration::from_secs(5))?;
    conn.execute_batch(SCHEMA)?;
    Ok(conn)
}

/// Build the connection pool used by the service and run migrations once.
///
/// `wait` bounds both pool checkout and SQLite lock waits.
pub fn open_pool<P: AsRef<Path>>(path: P, wait: Duration) -> ChatResult<Pool<SqliteConnectionManager>> {
    let manager = SqliteConnectionManager::file(path.as_ref()).with_init(move |c| configure(c, wait));
    let pool = Pool::builder()
        .connection_timeout(wait)
        .build(manager)?;
    pool.get()?.execute_batch(SCHEMA)?;
    Ok(pool)
}

fn configure(conn: &Connection, busy: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    // In-memory databases report "memory" and ignore WAL.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    Ok(())
}

/// Start a write transaction that takes the write lock up front, so a
/// read-then-write sequence cannot fail with a lock upgrade error.
pub fn write_tx(conn: &Connection) -> rusqlite::Result<Transaction<'_>> {
    Transaction::new_unchecked(conn, TransactionBehavior::Immediate)
}

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Read a TEXT column holding a UUID.
pub fn uuid_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read a TEXT column holding one of the enum tags in this crate.
pub fn enum_col<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown tag {raw:?}").into(),
        )
    })
}

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS channels (
  id TEXT PRIMARY KEY,
  organization_id TEXT NOT NULL,
  name TEXT NOT NULL,
  channel_type TEXT NOT NULL CHECK (channel_type IN ('group', 'private')),
  owner_id TEXT NOT NULL,
  is_archived INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_members (
  channel_id TEXT NOT NULL REFERENCES channels(id),
  user_id TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  joined_at INTEGER NOT NULL,
  left_at INTEGER,
  PRIMARY KEY (channel_id, user_id)
);
CREATE INDEX IF NOT EXISTS channel_members_user ON channel_members(user_id, is_active);

CREATE TABLE IF NOT EXISTS messages (
  id TEXT PRIMARY KEY,
  channel_id TEXT NOT NULL REFERENCES channels(id),
  sender_id TEXT NOT NULL,
  sender_name TEXT NOT NULL,
  content TEXT NOT NULL,
  message_type TEXT NOT NULL,
  is_deleted INTEGER NOT NULL DEFAULT 0,
  is_edited INTEGER NOT NULL DEFAULT 0,
  edited_at INTEGER,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_history ON messages(channel_id, created_at DESC, id DESC);

CREATE TABLE IF NOT EXISTS delivery_logs (
  message_id TEXT NOT NULL REFERENCES messages(id),
  recipient_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pending', 'delivered', 'failed')),
  error TEXT,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  PRIMARY KEY (message_id, recipient_id)
);

CREATE TABLE IF NOT EXISTS read_receipts (
  message_id TEXT NOT NULL REFERENCES messages(id),
  user_id TEXT NOT NULL,
  read_at INTEGER NOT NULL,
  PRIMARY KEY (message_id, user_id)
);

CREATE TABLE IF NOT EXISTS notifications (
  id TEXT PRIMARY KEY,
  recipient_id TEXT NOT NULL,
  channel_id TEXT NOT NULL REFERENCES channels(id),
  message_id TEXT NOT NULL REFERENCES messages(id),
  notification_type TEXT NOT NULL,
  is_read INTEGER NOT NULL DEFAULT 0,
  created_at INTEGER NOT NULL,
  UNIQUE (message_id, recipient_id)
);
CREATE INDEX IF NOT EXISTS notifications_inbox ON notifications(recipient_id, is_read, channel_id);
"#;
