use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{enum_col, now_ms, uuid_col, write_tx};
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, MessageType};
use crate::{channels, delivery, members, notifications};

pub const MAX_CONTENT_CHARS: usize = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;

const MESSAGE_COLUMNS: &str = "id, channel_id, sender_id, sender_name, content, message_type, \
     is_deleted, is_edited, edited_at, created_at, updated_at";

/// Cursor for pagination.
#[derive(Clone, Copy, Debug)]
pub enum Cursor {
    /// `created_at` of the oldest message already seen.
    Timestamp(i64),
    /// Id of the oldest message already seen.
    Id(Uuid),
}

fn validate_content(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::InvalidInput("empty_message"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::InvalidInput("message_too_long"));
    }
    Ok(())
}

fn row_to_msg(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        channel_id: uuid_col(row, 1)?,
        sender_id: uuid_col(row, 2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        message_type: enum_col(row, 5, MessageType::parse)?,
        is_deleted: row.get::<_, i64>(6)? != 0,
        is_edited: row.get::<_, i64>(7)? != 0,
        edited_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// A persisted message and what its send wrote alongside it.
#[derive(Debug)]
pub struct Sent {
    pub message: Message,
    /// Active members at the moment of the insert, sender included.
    pub snapshot: Vec<Uuid>,
    pub deliveries: usize,
    pub notifications: usize,
    /// Set when the delivery and notification rows could not be written with
    /// the message. The message itself is committed either way.
    pub fanout_error: Option<ChatError>,
}

/// Persist a message together with its delivery logs and notifications.
///
/// The member snapshot, the message row and one pending delivery log plus one
/// unread notification per recipient share a transaction. The fanout rows sit
/// behind a savepoint, so a failure there leaves the message committed and is
/// reported in [`Sent::fanout_error`] for the caller to retry.
///
/// `created_at` is strictly increasing within a channel, so history order and
/// insertion order agree even when two sends land in the same millisecond.
pub fn send_message(
    conn: &Connection,
    channel_id: &Uuid,
    sender_id: &Uuid,
    sender_name: &str,
    content: &str,
    message_type: MessageType,
) -> ChatResult<Sent> {
    validate_content(content)?;
    let mut tx = write_tx(conn)?;
    let channel = channels::get_channel(&tx, channel_id)?;
    members::require_active_member(&tx, channel_id, sender_id)?;
    if channel.is_archived {
        return Err(ChatError::Conflict("channel_archived"));
    }
    let last: Option<i64> = tx.query_row(
        "SELECT MAX(created_at) FROM messages WHERE channel_id = ?1",
        [channel_id.to_string()],
        |row| row.get(0),
    )?;
    let now = match last {
        Some(last) => now_ms().max(last + 1),
        None => now_ms(),
    };
    let message = Message {
        id: Uuid::new_v4(),
        channel_id: *channel_id,
        sender_id: *sender_id,
        sender_name: sender_name.to_string(),
        content: content.to_string(),
        message_type,
        is_deleted: false,
        is_edited: false,
        edited_at: None,
        created_at: now,
        updated_at: now,
    };
    tx.execute(
        &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, NULL, ?7, ?7)"),
        params![
            message.id.to_string(),
            channel_id.to_string(),
            sender_id.to_string(),
            sender_name,
            content,
            message_type.as_str(),
            now
        ],
    )?;
    let snapshot = members::active_member_ids(&tx, channel_id)?;

    let (mut deliveries, mut notified, mut fanout_error) = (0, 0, None);
    {
        let sp = tx.savepoint()?;
        let written = delivery::fanout_deliveries(&sp, &message, &snapshot).and_then(|d| {
            Ok((d, notifications::fanout_notifications(&sp, &message, &snapshot)?))
        });
        match written {
            Ok((d, n)) => {
                sp.commit()?;
                deliveries = d;
                notified = n;
            }
            // dropping the savepoint rolls the partial fanout back
            Err(e) => fanout_error = Some(e),
        }
    }
    tx.commit()?;
    Ok(Sent {
        message,
        snapshot,
        deliveries,
        notifications: notified,
        fanout_error,
    })
}

/// Fetch a message by id, deleted or not.
pub fn find_message(conn: &Connection, id: &Uuid) -> ChatResult<Option<Message>> {
    let mut stmt = conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))?;
    let msg = stmt.query_row([id.to_string()], row_to_msg).optional()?;
    Ok(msg)
}

pub fn get_message(conn: &Connection, id: &Uuid) -> ChatResult<Message> {
    find_message(conn, id)?.ok_or(ChatError::NotFound("message"))
}

/// Like [`get_message`] but treats soft-deleted messages as missing.
pub fn get_live_message(conn: &Connection, id: &Uuid) -> ChatResult<Message> {
    match find_message(conn, id)? {
        Some(m) if !m.is_deleted => Ok(m),
        _ => Err(ChatError::NotFound("message")),
    }
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

/// List non-deleted messages of a channel, newest first, strictly older than
/// the cursor.
pub fn list_messages(
    conn: &Connection,
    channel_id: &Uuid,
    before: Option<Cursor>,
    limit: usize,
) -> ChatResult<Vec<Message>> {
    let limit = limit.clamp(1, MAX_PAGE_SIZE);
    let (ts, id) = match before {
        Some(Cursor::Timestamp(ts)) => (ts, None),
        Some(Cursor::Id(id)) => {
            let msg = get_message(conn, &id)?;
            if msg.channel_id != *channel_id {
                return Err(ChatError::InvalidInput("cursor_channel"));
            }
            (msg.created_at, Some(id))
        }
        None => (i64::MAX, None),
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages \
         WHERE channel_id = ?1 AND is_deleted = 0 \
           AND (created_at < ?2 OR (created_at = ?2 AND ?3 IS NOT NULL AND id < ?3)) \
         ORDER BY created_at DESC, id DESC LIMIT ?4"
    ))?;
    let msgs = stmt
        .query_map(
            params![
                channel_id.to_string(),
                ts,
                id.map(|i| i.to_string()),
                limit as i64
            ],
            row_to_msg,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(msgs)
}

/// Replace the content of a live message. Only its sender may edit it.
pub fn edit_message(
    conn: &Connection,
    message_id: &Uuid,
    editor_id: &Uuid,
    content: &str,
) -> ChatResult<Message> {
    validate_content(content)?;
    let tx = write_tx(conn)?;
    let mut msg = get_live_message(&tx, message_id)?;
    if msg.sender_id != *editor_id {
        return Err(ChatError::Forbidden);
    }
    let now = now_ms();
    tx.execute(
        "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3, updated_at = ?3 WHERE id = ?1 AND is_deleted = 0",
        params![message_id.to_string(), content, now],
    )?;
    tx.commit()?;
    msg.content = content.to_string();
    msg.is_edited = true;
    msg.edited_at = Some(now);
    msg.updated_at = now;
    Ok(msg)
}

/// Soft-delete a message. Deleting twice is an error.
///
/// The sender or the channel owner may delete. Delivery logs, receipts and
/// notifications are left as they are.
pub fn delete_message(conn: &Connection, message_id: &Uuid, actor_id: &Uuid) -> ChatResult<Message> {
    let tx = write_tx(conn)?;
    let mut msg = get_live_message(&tx, message_id)?;
    if msg.sender_id != *actor_id {
        let channel = channels::get_channel(&tx, &msg.channel_id)?;
        if channel.owner_id != *actor_id {
            return Err(ChatError::Forbidden);
        }
    }
    let now = now_ms();
    let changed = tx.execute(
        "UPDATE messages SET is_deleted = 1, updated_at = ?2 WHERE id = ?1 AND is_deleted = 0",
        params![message_id.to_string(), now],
    )?;
    if changed == 0 {
        return Err(ChatError::NotFound("message"));
    }
    tx.commit()?;
    msg.is_deleted = true;
    msg.updated_at = now;
    Ok(msg)
}
