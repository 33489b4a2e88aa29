use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::channels;
use crate::db::{now_ms, uuid_col};
use crate::error::{ChatError, ChatResult};
pub use crate::model::Membership;

fn row_to_membership(row: &Row<'_>) -> rusqlite::Result<Membership> {
    Ok(Membership {
        channel_id: uuid_col(row, 0)?,
        user_id: uuid_col(row, 1)?,
        is_active: row.get::<_, i64>(2)? != 0,
        joined_at: row.get(3)?,
        left_at: row.get(4)?,
    })
}

fn find_membership(conn: &Connection, channel_id: &Uuid, user_id: &Uuid) -> ChatResult<Option<Membership>> {
    let mut stmt = conn.prepare(
        "SELECT channel_id, user_id, is_active, joined_at, left_at FROM channel_members WHERE channel_id = ?1 AND user_id = ?2",
    )?;
    let m = stmt
        .query_row(params![channel_id.to_string(), user_id.to_string()], row_to_membership)
        .optional()?;
    Ok(m)
}

/// Add a user to a channel. A previously removed member is re-activated.
pub fn add_member(conn: &Connection, channel_id: &Uuid, user_id: &Uuid) -> ChatResult<Membership> {
    channels::get_channel(conn, channel_id)?;
    let now = now_ms();
    match find_membership(conn, channel_id, user_id)? {
        Some(m) if m.is_active => Err(ChatError::Conflict("membership_exists")),
        Some(_) => {
            let changed = conn.execute(
                "UPDATE channel_members SET is_active = 1, joined_at = ?3, left_at = NULL \
                 WHERE channel_id = ?1 AND user_id = ?2 AND is_active = 0",
                params![channel_id.to_string(), user_id.to_string(), now],
            )?;
            if changed == 0 {
                return Err(ChatError::Conflict("membership_exists"));
            }
            Ok(Membership {
                channel_id: *channel_id,
                user_id: *user_id,
                is_active: true,
                joined_at: now,
                left_at: None,
            })
        }
        None => {
            let res = conn.execute(
                "INSERT INTO channel_members (channel_id, user_id, is_active, joined_at) VALUES (?1, ?2, 1, ?3)",
                params![channel_id.to_string(), user_id.to_string(), now],
            );
            match res {
                Ok(_) => Ok(Membership {
                    channel_id: *channel_id,
                    user_id: *user_id,
                    is_active: true,
                    joined_at: now,
                    left_at: None,
                }),
                Err(e) if crate::error::is_constraint_violation(&e) => {
                    Err(ChatError::Conflict("membership_exists"))
                }
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Deactivate a membership. The row stays so history remains attributable.
pub fn remove_member(conn: &Connection, channel_id: &Uuid, user_id: &Uuid) -> ChatResult<Membership> {
    let now = now_ms();
    let changed = conn.execute(
        "UPDATE channel_members SET is_active = 0, left_at = ?3 WHERE channel_id = ?1 AND user_id = ?2 AND is_active = 1",
        params![channel_id.to_string(), user_id.to_string(), now],
    )?;
    if changed == 0 {
        channels::get_channel(conn, channel_id)?;
        return Err(ChatError::NotFound("membership"));
    }
    find_membership(conn, channel_id, user_id)?.ok_or(ChatError::NotFound("membership"))
}

pub fn is_active_member(conn: &Connection, channel_id: &Uuid, user_id: &Uuid) -> ChatResult<bool> {
    let mut stmt = conn.prepare(
        "SELECT 1 FROM channel_members WHERE channel_id = ?1 AND user_id = ?2 AND is_active = 1",
    )?;
    let exists: Option<i64> = stmt
        .query_row(params![channel_id.to_string(), user_id.to_string()], |row| row.get(0))
        .optional()?;
    Ok(exists.is_some())
}

/// Fail with `Forbidden` unless the user is an active member.
pub fn require_active_member(conn: &Connection, channel_id: &Uuid, user_id: &Uuid) -> ChatResult<()> {
    if is_active_member(conn, channel_id, user_id)? {
        Ok(())
    } else {
        Err(ChatError::Forbidden)
    }
}

pub fn list_active_members(conn: &Connection, channel_id: &Uuid) -> ChatResult<Vec<Membership>> {
    let mut stmt = conn.prepare(
        "SELECT channel_id, user_id, is_active, joined_at, left_at FROM channel_members \
         WHERE channel_id = ?1 AND is_active = 1 ORDER BY joined_at, user_id",
    )?;
    let members = stmt
        .query_map([channel_id.to_string()], row_to_membership)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

/// Ids of the active members, used as the fanout snapshot.
pub fn active_member_ids(conn: &Connection, channel_id: &Uuid) -> ChatResult<Vec<Uuid>> {
    Ok(list_active_members(conn, channel_id)?
        .into_iter()
        .map(|m| m.user_id)
        .collect())
}
