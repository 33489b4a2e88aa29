use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::db::{now_ms, uuid_col, write_tx};
use crate::error::{is_constraint_violation, ChatResult};
use crate::model::{Message, ReadReceipt};
use crate::{members, messages};

/// Result of a mark-as-read call.
#[derive(Debug, Clone)]
pub struct ReadOutcome {
    pub message: Message,
    pub receipt: ReadReceipt,
    /// False when the user had already read the message.
    pub newly_read: bool,
    /// True when the reader's delivery row moved from pending to delivered.
    pub delivery_changed: bool,
}

fn row_to_receipt(row: &Row<'_>) -> rusqlite::Result<ReadReceipt> {
    Ok(ReadReceipt {
        message_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        read_at: row.get(2)?,
    })
}

fn get_receipt(conn: &Connection, message_id: &Uuid, user_id: &Uuid) -> ChatResult<ReadReceipt> {
    let receipt = conn.query_row(
        "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id = ?1 AND user_id = ?2",
        params![message_id.to_string(), user_id.to_string()],
        row_to_receipt,
    )?;
    Ok(receipt)
}

/// Mark a message as read by `user_id`.
///
/// A second call for the same pair hits the primary key and is reported as
/// `newly_read = false` rather than an error. The reader's pending delivery row
/// becomes delivered and their notification for the message is marked read.
/// Only rows written when the message was sent are touched; a member who
/// joined later gets a receipt and nothing else.
pub fn mark_message_as_read(conn: &Connection, message_id: &Uuid, user_id: &Uuid) -> ChatResult<ReadOutcome> {
    let tx = write_tx(conn)?;
    let message = messages::get_live_message(&tx, message_id)?;
    members::require_active_member(&tx, &message.channel_id, user_id)?;
    let now = now_ms();
    let inserted = tx.execute(
        "INSERT INTO read_receipts (message_id, user_id, read_at) VALUES (?1, ?2, ?3)",
        params![message_id.to_string(), user_id.to_string(), now],
    );
    let newly_read = match inserted {
        Ok(_) => true,
        Err(e) if is_constraint_violation(&e) => false,
        Err(e) => return Err(e.into()),
    };
    let delivery_changed = tx.execute(
        "UPDATE delivery_logs SET status = 'delivered', updated_at = ?3 \
         WHERE message_id = ?1 AND recipient_id = ?2 AND status = 'pending'",
        params![message_id.to_string(), user_id.to_string(), now],
    )? > 0;
    tx.execute(
        "UPDATE notifications SET is_read = 1 WHERE message_id = ?1 AND recipient_id = ?2 AND is_read = 0",
        params![message_id.to_string(), user_id.to_string()],
    )?;
    let receipt = get_receipt(&tx, message_id, user_id)?;
    tx.commit()?;
    Ok(ReadOutcome {
        message,
        receipt,
        newly_read,
        delivery_changed,
    })
}

pub fn get_message_read_receipts(conn: &Connection, message_id: &Uuid) -> ChatResult<Vec<ReadReceipt>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, user_id, read_at FROM read_receipts WHERE message_id = ?1 ORDER BY read_at, user_id",
    )?;
    let receipts = stmt
        .query_map([message_id.to_string()], row_to_receipt)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(receipts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{create_channel, ChannelType};
    use crate::error::ChatError;
    use crate::model::{DeliveryStatus, MessageType};
    use crate::{db, delivery, notifications};

    #[test]
    fn read_is_idempotent_and_updates_side_rows() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "c", ChannelType::Group).unwrap();
        members::add_member(&conn, &c.id, &b).unwrap();
        let m = messages::send_message(&conn, &c.id, &a, "A", "hi", MessageType::Text)
            .unwrap()
            .message;

        let first = mark_message_as_read(&conn, &m.id, &b).unwrap();
        assert!(first.newly_read);
        assert!(first.delivery_changed);
        let second = mark_message_as_read(&conn, &m.id, &b).unwrap();
        assert!(!second.newly_read);
        assert!(!second.delivery_changed);
        assert_eq!(second.receipt, first.receipt);

        assert_eq!(get_message_read_receipts(&conn, &m.id).unwrap().len(), 1);
        let log = delivery::find_delivery_log(&conn, &m.id, &b).unwrap().unwrap();
        assert_eq!(log.status, DeliveryStatus::Delivered);
        assert!(notifications::get_unread_notifications(&conn, &b).unwrap().is_empty());
    }

    #[test]
    fn late_members_and_the_sender_get_no_fanout_rows() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b, late) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "c", ChannelType::Group).unwrap();
        members::add_member(&conn, &c.id, &b).unwrap();
        let m = messages::send_message(&conn, &c.id, &a, "A", "hi", MessageType::Text)
            .unwrap()
            .message;
        members::add_member(&conn, &c.id, &late).unwrap();

        let read = mark_message_as_read(&conn, &m.id, &late).unwrap();
        assert!(read.newly_read);
        assert!(!read.delivery_changed);
        assert!(delivery::find_delivery_log(&conn, &m.id, &late).unwrap().is_none());
        assert!(notifications::get_unread_notifications(&conn, &late).unwrap().is_empty());

        assert!(!mark_message_as_read(&conn, &m.id, &a).unwrap().delivery_changed);
        assert!(delivery::find_delivery_log(&conn, &m.id, &a).unwrap().is_none());
        assert_eq!(delivery::get_delivery_logs(&conn, &m.id).unwrap().len(), 1);
        assert_eq!(get_message_read_receipts(&conn, &m.id).unwrap().len(), 2);
    }

    #[test]
    fn strangers_and_deleted_messages() {
        let conn = db::init_db(":memory:").unwrap();
        let a = Uuid::new_v4();
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "c", ChannelType::Group).unwrap();
        let m = messages::send_message(&conn, &c.id, &a, "A", "hi", MessageType::Text)
            .unwrap()
            .message;
        assert!(matches!(
            mark_message_as_read(&conn, &m.id, &Uuid::new_v4()),
            Err(ChatError::Forbidden)
        ));
        messages::delete_message(&conn, &m.id, &a).unwrap();
        assert!(matches!(
            mark_message_as_read(&conn, &m.id, &a),
            Err(ChatError::NotFound("message"))
        ));
        assert!(matches!(
            mark_message_as_read(&conn, &Uuid::new_v4(), &a),
            Err(ChatError::NotFound("message"))
        ));
    }
}
