pub use chat_protocol::{DeliveryStatus, Message, MessageType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Group,
    Private,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Group => "group",
            ChannelType::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "group" => Some(ChannelType::Group),
            "private" => Some(ChannelType::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub channel_type: ChannelType,
    pub owner_id: Uuid,
    pub is_archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A channel as listed for one user.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChannelSummary {
    #[serde(flatten)]
    pub channel: Channel,
    pub last_activity_at: i64,
    pub unread_count: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Membership {
    pub channel_id: Uuid,
    pub user_id: Uuid,
    pub is_active: bool,
    pub joined_at: i64,
    pub left_at: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    pub channel_id: Uuid,
    pub message_count: u64,
    pub member_count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DeliveryLog {
    pub message_id: Uuid,
    pub recipient_id: Uuid,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReadReceipt {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub read_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewMessage,
    /// Reserved for content scanning; never produced by fanout today.
    Mention,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::NewMessage => "new_message",
            NotificationType::Mention => "mention",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new_message" => Some(NotificationType::NewMessage),
            "mention" => Some(NotificationType::Mention),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    pub recipient_id: Uuid,
    pub channel_id: Uuid,
    pub message_id: Uuid,
    pub notification_type: NotificationType,
    pub is_read: bool,
    pub created_at: i64,
}
