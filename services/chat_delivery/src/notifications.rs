use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{enum_col, now_ms, uuid_col};
use crate::error::{ChatError, ChatResult};
use crate::model::{Message, Notification, NotificationType};

const COLUMNS: &str = "id, recipient_id, channel_id, message_id, notification_type, is_read, created_at";

fn row_to_notification(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: uuid_col(row, 0)?,
        recipient_id: uuid_col(row, 1)?,
        channel_id: uuid_col(row, 2)?,
        message_id: uuid_col(row, 3)?,
        notification_type: enum_col(row, 4, NotificationType::parse)?,
        is_read: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
    })
}

/// Create one unread `new_message` notification per recipient, sender excluded.
///
/// The (message, recipient) pair is unique, so a retried fanout never
/// duplicates. Returns the number of rows inserted.
pub fn fanout_notifications(conn: &Connection, message: &Message, members: &[Uuid]) -> ChatResult<usize> {
    let now = now_ms();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO notifications (id, recipient_id, channel_id, message_id, notification_type, is_read, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
    )?;
    let mut inserted = 0;
    for recipient in members.iter().filter(|m| **m != message.sender_id) {
        inserted += stmt.execute(params![
            Uuid::new_v4().to_string(),
            recipient.to_string(),
            message.channel_id.to_string(),
            message.id.to_string(),
            NotificationType::NewMessage.as_str(),
            now
        ])?;
    }
    Ok(inserted)
}

pub fn find_notification(conn: &Connection, id: &Uuid) -> ChatResult<Option<Notification>> {
    let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM notifications WHERE id = ?1"))?;
    let n = stmt
        .query_row([id.to_string()], row_to_notification)
        .optional()?;
    Ok(n)
}

/// Unread notifications for `user_id`, newest first.
pub fn get_unread_notifications(conn: &Connection, user_id: &Uuid) -> ChatResult<Vec<Notification>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM notifications WHERE recipient_id = ?1 AND is_read = 0 \
         ORDER BY created_at DESC, id"
    ))?;
    let rows = stmt
        .query_map([user_id.to_string()], row_to_notification)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mark one notification read. Only its recipient may do so.
pub fn mark_notification_as_read(conn: &Connection, id: &Uuid, user_id: &Uuid) -> ChatResult<Notification> {
    let mut n = find_notification(conn, id)?.ok_or(ChatError::NotFound("notification"))?;
    if n.recipient_id != *user_id {
        return Err(ChatError::Forbidden);
    }
    if !n.is_read {
        conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", [id.to_string()])?;
        n.is_read = true;
    }
    Ok(n)
}

/// Mark every unread notification of `user_id` in a channel read.
pub fn mark_all_notifications_as_read(conn: &Connection, user_id: &Uuid, channel_id: &Uuid) -> ChatResult<usize> {
    let changed = conn.execute(
        "UPDATE notifications SET is_read = 1 WHERE recipient_id = ?1 AND channel_id = ?2 AND is_read = 0",
        params![user_id.to_string(), channel_id.to_string()],
    )?;
    Ok(changed)
}

pub fn unread_count(conn: &Connection, user_id: &Uuid, channel_id: &Uuid) -> ChatResult<u32> {
    let n: u32 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND channel_id = ?2 AND is_read = 0",
        params![user_id.to_string(), channel_id.to_string()],
        |row| row.get(0),
    )?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{create_channel, ChannelType};
    use crate::model::MessageType;
    use crate::{db, members, messages};

    #[test]
    fn fanout_skips_sender_and_dedupes() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b, d) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "c", ChannelType::Group).unwrap();
        members::add_member(&conn, &c.id, &b).unwrap();
        members::add_member(&conn, &c.id, &d).unwrap();
        let sent = messages::send_message(&conn, &c.id, &a, "A", "hi", MessageType::Text).unwrap();
        assert_eq!(sent.notifications, 2);
        conn.execute("DELETE FROM notifications", []).unwrap();
        let (m, snapshot) = (sent.message, sent.snapshot);

        assert_eq!(fanout_notifications(&conn, &m, &snapshot).unwrap(), 2);
        assert_eq!(fanout_notifications(&conn, &m, &snapshot).unwrap(), 0);
        assert!(get_unread_notifications(&conn, &a).unwrap().is_empty());
        let inbox = get_unread_notifications(&conn, &b).unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].message_id, m.id);
        assert_eq!(inbox[0].notification_type, NotificationType::NewMessage);
        assert_eq!(unread_count(&conn, &d, &c.id).unwrap(), 1);
    }

    #[test]
    fn mark_read_checks_owner() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "c", ChannelType::Group).unwrap();
        members::add_member(&conn, &c.id, &b).unwrap();
        messages::send_message(&conn, &c.id, &a, "A", "hi", MessageType::Text).unwrap();
        let n = get_unread_notifications(&conn, &b).unwrap().remove(0);

        assert!(matches!(mark_notification_as_read(&conn, &n.id, &a), Err(ChatError::Forbidden)));
        assert!(matches!(
            mark_notification_as_read(&conn, &Uuid::new_v4(), &b),
            Err(ChatError::NotFound("notification"))
        ));
        assert!(mark_notification_as_read(&conn, &n.id, &b).unwrap().is_read);
        assert!(mark_notification_as_read(&conn, &n.id, &b).unwrap().is_read);
        assert_eq!(unread_count(&conn, &b, &c.id).unwrap(), 0);
    }

    #[test]
    fn mark_all_is_scoped_to_channel() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let org = Uuid::new_v4();
        let c1 = create_channel(&conn, &org, &a, "one", ChannelType::Group).unwrap();
        let c2 = create_channel(&conn, &org, &a, "two", ChannelType::Group).unwrap();
        for c in [&c1, &c2] {
            members::add_member(&conn, &c.id, &b).unwrap();
            for text in ["x", "y"] {
                messages::send_message(&conn, &c.id, &a, "A", text, MessageType::Text).unwrap();
            }
        }
        assert_eq!(mark_all_notifications_as_read(&conn, &b, &c1.id).unwrap(), 2);
        assert_eq!(mark_all_notifications_as_read(&conn, &b, &c1.id).unwrap(), 0);
        assert_eq!(unread_count(&conn, &b, &c2.id).unwrap(), 2);
    }
}
