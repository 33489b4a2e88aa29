use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{enum_col, now_ms, uuid_col, write_tx};
use crate::error::{ChatError, ChatResult};
pub use crate::model::{Channel, ChannelStats, ChannelSummary, ChannelType};

const MAX_NAME_CHARS: usize = 100;

const CHANNEL_COLUMNS: &str =
    "c.id, c.organization_id, c.name, c.channel_type, c.owner_id, c.is_archived, c.created_at, c.updated_at";

fn validate_name(name: &str) -> ChatResult<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_CHARS {
        return Err(ChatError::InvalidInput("channel_name"));
    }
    Ok(name.to_string())
}

fn row_to_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: uuid_col(row, 0)?,
        organization_id: uuid_col(row, 1)?,
        name: row.get(2)?,
        channel_type: enum_col(row, 3, ChannelType::parse)?,
        owner_id: uuid_col(row, 4)?,
        is_archived: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Create a channel and make the owner its first active member.
pub fn create_channel(
    conn: &Connection,
    organization_id: &Uuid,
    owner_id: &Uuid,
    name: &str,
    channel_type: ChannelType,
) -> ChatResult<Channel> {
    let name = validate_name(name)?;
    let id = Uuid::new_v4();
    let now = now_ms();
    let tx = write_tx(conn)?;
    tx.execute(
        "INSERT INTO channels (id, organization_id, name, channel_type, owner_id, is_archived, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
        params![
            id.to_string(),
            organization_id.to_string(),
            name,
            channel_type.as_str(),
            owner_id.to_string(),
            now
        ],
    )?;
    tx.execute(
        "INSERT INTO channel_members (channel_id, user_id, is_active, joined_at) VALUES (?1, ?2, 1, ?3)",
        params![id.to_string(), owner_id.to_string(), now],
    )?;
    tx.commit()?;
    Ok(Channel {
        id,
        organization_id: *organization_id,
        name,
        channel_type,
        owner_id: *owner_id,
        is_archived: false,
        created_at: now,
        updated_at: now,
    })
}

pub fn find_channel(conn: &Connection, id: &Uuid) -> ChatResult<Option<Channel>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANNEL_COLUMNS} FROM channels c WHERE c.id = ?1"
    ))?;
    let channel = stmt
        .query_row([id.to_string()], row_to_channel)
        .optional()?;
    Ok(channel)
}

pub fn get_channel(conn: &Connection, id: &Uuid) -> ChatResult<Channel> {
    find_channel(conn, id)?.ok_or(ChatError::NotFound("channel"))
}

/// Update display name and/or type.
pub fn update_channel(
    conn: &Connection,
    id: &Uuid,
    name: Option<&str>,
    channel_type: Option<ChannelType>,
) -> ChatResult<Channel> {
    let mut channel = get_channel(conn, id)?;
    if let Some(name) = name {
        channel.name = validate_name(name)?;
    }
    if let Some(kind) = channel_type {
        channel.channel_type = kind;
    }
    channel.updated_at = now_ms();
    conn.execute(
        "UPDATE channels SET name = ?2, channel_type = ?3, updated_at = ?4 WHERE id = ?1",
        params![
            id.to_string(),
            channel.name,
            channel.channel_type.as_str(),
            channel.updated_at
        ],
    )?;
    Ok(channel)
}

/// Flip the archived flag. Messages and memberships are left untouched.
pub fn archive_channel(conn: &Connection, id: &Uuid) -> ChatResult<Channel> {
    let mut channel = get_channel(conn, id)?;
    if channel.is_archived {
        return Ok(channel);
    }
    channel.is_archived = true;
    channel.updated_at = now_ms();
    conn.execute(
        "UPDATE channels SET is_archived = 1, updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), channel.updated_at],
    )?;
    Ok(channel)
}

/// Remove a channel and everything that references it.
pub fn delete_channel(conn: &Connection, id: &Uuid) -> ChatResult<()> {
    let tx = write_tx(conn)?;
    let key = id.to_string();
    let exists: Option<i64> = tx
        .query_row("SELECT 1 FROM channels WHERE id = ?1", [&key], |row| row.get(0))
        .optional()?;
    if exists.is_none() {
        return Err(ChatError::NotFound("channel"));
    }
    const IN_CHANNEL: &str = "SELECT id FROM messages WHERE channel_id = ?1";
    tx.execute(
        &format!("DELETE FROM delivery_logs WHERE message_id IN ({IN_CHANNEL})"),
        [&key],
    )?;
    tx.execute(
        &format!("DELETE FROM read_receipts WHERE message_id IN ({IN_CHANNEL})"),
        [&key],
    )?;
    tx.execute("DELETE FROM notifications WHERE channel_id = ?1", [&key])?;
    tx.execute("DELETE FROM messages WHERE channel_id = ?1", [&key])?;
    tx.execute("DELETE FROM channel_members WHERE channel_id = ?1", [&key])?;
    tx.execute("DELETE FROM channels WHERE id = ?1", [&key])?;
    tx.commit()?;
    Ok(())
}

/// Channels where the user is an active member, most recently active first.
pub fn list_channels_for_user(conn: &Connection, user_id: &Uuid) -> ChatResult<Vec<ChannelSummary>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANNEL_COLUMNS}, \
           COALESCE((SELECT MAX(m.created_at) FROM messages m WHERE m.channel_id = c.id AND m.is_deleted = 0), c.updated_at) AS activity, \
           (SELECT COUNT(*) FROM notifications n WHERE n.channel_id = c.id AND n.recipient_id = ?1 AND n.is_read = 0) AS unread \
         FROM channels c JOIN channel_members cm ON cm.channel_id = c.id \
         WHERE cm.user_id = ?1 AND cm.is_active = 1 \
         ORDER BY activity DESC, c.id"
    ))?;
    let rows = stmt
        .query_map([user_id.to_string()], |row| {
            Ok(ChannelSummary {
                channel: row_to_channel(row)?,
                last_activity_at: row.get(8)?,
                unread_count: row.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn channel_stats(conn: &Connection, id: &Uuid) -> ChatResult<ChannelStats> {
    get_channel(conn, id)?;
    let key = id.to_string();
    let message_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE channel_id = ?1 AND is_deleted = 0",
        [&key],
        |row| row.get(0),
    )?;
    let member_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM channel_members WHERE channel_id = ?1 AND is_active = 1",
        [&key],
        |row| row.get(0),
    )?;
    Ok(ChannelStats {
        channel_id: *id,
        message_count: message_count as u64,
        member_count: member_count as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, members};

    #[test]
    fn create_makes_owner_member() {
        let conn = db::init_db(":memory:").unwrap();
        let (org, owner) = (Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &org, &owner, "  General ", ChannelType::Group).unwrap();
        assert_eq!(c.name, "General");
        assert!(members::is_active_member(&conn, &c.id, &owner).unwrap());
        assert_eq!(get_channel(&conn, &c.id).unwrap(), c);
        assert!(create_channel(&conn, &org, &owner, "   ", ChannelType::Group).is_err());
    }

    #[test]
    fn unknown_channel_is_not_found() {
        let conn = db::init_db(":memory:").unwrap();
        let id = Uuid::new_v4();
        assert!(matches!(get_channel(&conn, &id), Err(ChatError::NotFound(_))));
        assert!(matches!(archive_channel(&conn, &id), Err(ChatError::NotFound(_))));
        assert!(matches!(delete_channel(&conn, &id), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn archive_is_a_flag_flip() {
        let conn = db::init_db(":memory:").unwrap();
        let owner = Uuid::new_v4();
        let c = create_channel(&conn, &Uuid::new_v4(), &owner, "ops", ChannelType::Private).unwrap();
        let archived = archive_channel(&conn, &c.id).unwrap();
        assert!(archived.is_archived);
        assert!(archive_channel(&conn, &c.id).unwrap().is_archived);
        assert_eq!(members::list_active_members(&conn, &c.id).unwrap().len(), 1);
    }

    #[test]
    fn update_renames() {
        let conn = db::init_db(":memory:").unwrap();
        let c = create_channel(&conn, &Uuid::new_v4(), &Uuid::new_v4(), "a", ChannelType::Group).unwrap();
        let u = update_channel(&conn, &c.id, Some("b"), Some(ChannelType::Private)).unwrap();
        assert_eq!(u.name, "b");
        assert_eq!(u.channel_type, ChannelType::Private);
        assert_eq!(get_channel(&conn, &c.id).unwrap().name, "b");
    }

    #[test]
    fn list_orders_by_activity_and_counts_unread() {
        let conn = db::init_db(":memory:").unwrap();
        let (org, me, other) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let quiet = create_channel(&conn, &org, &me, "quiet", ChannelType::Group).unwrap();
        let busy = create_channel(&conn, &org, &other, "busy", ChannelType::Group).unwrap();
        members::add_member(&conn, &busy.id, &me).unwrap();
        crate::messages::send_message(&conn, &busy.id, &other, "Other", "hey", crate::model::MessageType::Text)
            .unwrap();

        let list = list_channels_for_user(&conn, &me).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].channel.id, busy.id);
        assert_eq!(list[0].unread_count, 1);
        assert_eq!(list[1].channel.id, quiet.id);
        assert_eq!(list[1].unread_count, 0);

        members::remove_member(&conn, &busy.id, &me).unwrap();
        assert_eq!(list_channels_for_user(&conn, &me).unwrap().len(), 1);
    }

    #[test]
    fn delete_cascades_and_stats_count() {
        let conn = db::init_db(":memory:").unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let c = create_channel(&conn, &Uuid::new_v4(), &a, "x", ChannelType::Group).unwrap();
        members::add_member(&conn, &c.id, &b).unwrap();
        crate::messages::send_message(&conn, &c.id, &a, "A", "hi", crate::model::MessageType::Text).unwrap();
        let stats = channel_stats(&conn, &c.id).unwrap();
        assert_eq!((stats.message_count, stats.member_count), (1, 2));

        delete_channel(&conn, &c.id).unwrap();
        let logs: i64 = conn
            .query_row("SELECT COUNT(*) FROM delivery_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(logs, 0);
        assert!(find_channel(&conn, &c.id).unwrap().is_none());
    }
}
