use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{enum_col, now_ms, uuid_col};
use crate::error::{ChatError, ChatResult};
use crate::model::{DeliveryLog, DeliveryStatus, Message};

/// What a status update did to the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub log: DeliveryLog,
    pub changed: bool,
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<DeliveryLog> {
    Ok(DeliveryLog {
        message_id: uuid_col(row, 0)?,
        recipient_id: uuid_col(row, 1)?,
        status: enum_col(row, 2, DeliveryStatus::parse)?,
        error: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/// Decide the effect of moving from `from` to `to`.
///
/// `Ok(true)` means write, `Ok(false)` means the row already has that state.
fn check_transition(from: DeliveryStatus, to: DeliveryStatus) -> ChatResult<bool> {
    use DeliveryStatus::*;
    match (from, to) {
        (Pending, Pending) | (Delivered, Delivered) => Ok(false),
        (Pending, Delivered) | (Pending, Failed) => Ok(true),
        (Failed, _) => Err(ChatError::Conflict("delivery_terminal")),
        (Delivered, _) => Err(ChatError::Conflict("delivery_already_delivered")),
    }
}

/// Create a `pending` row for every recipient except the sender.
///
/// Rows that already exist are left alone, so re-running after a partial
/// failure only fills the gaps. Returns the number of rows inserted.
pub fn fanout_deliveries(conn: &Connection, message: &Message, members: &[Uuid]) -> ChatResult<usize> {
    let now = now_ms();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO delivery_logs (message_id, recipient_id, status, error, created_at, updated_at) \
         VALUES (?1, ?2, 'pending', NULL, ?3, ?3)",
    )?;
    let mut inserted = 0;
    for recipient in members.iter().filter(|m| **m != message.sender_id) {
        inserted += stmt.execute(params![message.id.to_string(), recipient.to_string(), now])?;
    }
    Ok(inserted)
}

/// Record recipients whose fanout could not be completed.
///
/// Missing rows are created as `failed`; `pending` rows are moved to `failed`.
/// Delivered rows are untouched.
pub fn record_failed(
    conn: &Connection,
    message: &Message,
    members: &[Uuid],
    error: &str,
) -> ChatResult<usize> {
    let now = now_ms();
    let mut stmt = conn.prepare(
        "INSERT INTO delivery_logs (message_id, recipient_id, status, error, created_at, updated_at) \
         VALUES (?1, ?2, 'failed', ?3, ?4, ?4) \
         ON CONFLICT(message_id, recipient_id) DO UPDATE SET status = 'failed', error = excluded.error, updated_at = excluded.updated_at \
         WHERE delivery_logs.status = 'pending'",
    )?;
    let mut written = 0;
    for recipient in members.iter().filter(|m| **m != message.sender_id) {
        written += stmt.execute(params![message.id.to_string(), recipient.to_string(), error, now])?;
    }
    Ok(written)
}

pub fn find_delivery_log(
    conn: &Connection,
    message_id: &Uuid,
    recipient_id: &Uuid,
) -> ChatResult<Option<DeliveryLog>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, recipient_id, status, error, created_at, updated_at FROM delivery_logs \
         WHERE message_id = ?1 AND recipient_id = ?2",
    )?;
    let log = stmt
        .query_row(params![message_id.to_string(), recipient_id.to_string()], row_to_log)
        .optional()?;
    Ok(log)
}

/// Move a delivery row to `status`.
///
/// The write is a compare-and-set on the status that was read, so concurrent
/// updates for the same pair apply one after another instead of clobbering.
pub fn update_delivery_status(
    conn: &Connection,
    message_id: &Uuid,
    recipient_id: &Uuid,
    status: DeliveryStatus,
    error: Option<&str>,
) -> ChatResult<Transition> {
    loop {
        let current = find_delivery_log(conn, message_id, recipient_id)?
            .ok_or(ChatError::NotFound("delivery_log"))?;
        if !check_transition(current.status, status)? {
            return Ok(Transition {
                log: current,
                changed: false,
            });
        }
        let now = now_ms();
        let error = if status == DeliveryStatus::Failed {
            Some(error.unwrap_or("unknown error"))
        } else {
            None
        };
        let changed = conn.execute(
            "UPDATE delivery_logs SET status = ?3, error = ?4, updated_at = ?5 \
             WHERE message_id = ?1 AND recipient_id = ?2 AND status = ?6",
            params![
                message_id.to_string(),
                recipient_id.to_string(),
                status.as_str(),
                error,
                now,
                current.status.as_str()
            ],
        )?;
        if changed == 1 {
            return Ok(Transition {
                log: DeliveryLog {
                    status,
                    error: error.map(str::to_string),
                    updated_at: now,
                    ..current
                },
                changed: true,
            });
        }
        tracing::debug!(%message_id, %recipient_id, "delivery status changed underneath, retrying");
    }
}

pub fn get_delivery_logs(conn: &Connection, message_id: &Uuid) -> ChatResult<Vec<DeliveryLog>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, recipient_id, status, error, created_at, updated_at FROM delivery_logs \
         WHERE message_id = ?1 ORDER BY created_at, recipient_id",
    )?;
    let logs = stmt
        .query_map([message_id.to_string()], row_to_log)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(logs)
}
