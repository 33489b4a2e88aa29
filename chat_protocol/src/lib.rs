use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of content carried by a message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Text,
    File,
    Image,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::File => "file",
            MessageType::Image => "image",
            MessageType::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(MessageType::Text),
            "file" => Some(MessageType::File),
            "image" => Some(MessageType::Image),
            "system" => Some(MessageType::System),
            _ => None,
        }
    }
}

/// Per-recipient delivery state stored for every message.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryStatus::Pending),
            "delivered" => Some(DeliveryStatus::Delivered),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }
}

/// Status reported back to a sender through `message_status` events.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Delivered,
    Read,
    Failed,
}

/// A chat message as seen by clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub content: String,
    pub message_type: MessageType,
    pub is_deleted: bool,
    pub is_edited: bool,
    pub edited_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Unread counter for one channel, sent when a session joins.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChannelUnread {
    pub channel_id: Uuid,
    pub unread: u32,
}

/// Actions a realtime session may send.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// Subscribe to every channel the user is an active member of.
    Join,
    JoinChannel {
        channel_id: Uuid,
    },
    LeaveChannel {
        channel_id: Uuid,
    },
    Message {
        channel_id: Uuid,
        content: String,
        #[serde(default)]
        message_type: Option<String>,
        #[serde(default)]
        client_ref: Option<String>,
    },
    MessageRead {
        message_id: Uuid,
    },
    /// Recipient acknowledges that a message reached its client.
    Ack {
        message_id: Uuid,
    },
}

/// Events pushed to a realtime session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum Event {
    Hello {
        user_id: Uuid,
        username: String,
    },
    Joined {
        channels: Vec<ChannelUnread>,
    },
    ChannelJoined {
        channel_id: Uuid,
    },
    ChannelLeft {
        channel_id: Uuid,
    },
    /// A new message in a subscribed channel. `delivery_status` is a
    /// presentation hint and does not mirror the stored delivery log.
    Message {
        message: Message,
        delivery_status: DeliveryStatus,
    },
    Sent {
        message_id: Uuid,
        client_ref: Option<String>,
        degraded: bool,
    },
    Read {
        message_id: Uuid,
        newly_read: bool,
    },
    MessageStatus {
        message_id: Uuid,
        recipient_id: Uuid,
        status: StatusKind,
        read_by: Option<Uuid>,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message_id: Uuid,
        channel_id: Uuid,
    },
    MemberJoined {
        channel_id: Uuid,
        user_id: Uuid,
    },
    MemberLeft {
        channel_id: Uuid,
        user_id: Uuid,
    },
    UserOnline {
        user_id: Uuid,
        username: String,
    },
    UserOffline {
        user_id: Uuid,
    },
    Error {
        code: String,
        message: String,
        client_ref: Option<String>,
    },
}

/// Error body returned by the HTTP API.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_uses_action_tag() {
        let channel_id = Uuid::new_v4();
        let raw = format!("{{\"action\":\"join_channel\",\"channel_id\":\"{}\"}}", channel_id);
        let action: Action = serde_json::from_str(&raw).unwrap();
        assert_eq!(action, Action::JoinChannel { channel_id });

        let action: Action = serde_json::from_str(&format!(
            "{{\"action\":\"message\",\"channel_id\":\"{}\",\"content\":\"hi\"}}",
            channel_id
        ))
        .unwrap();
        assert!(matches!(
            action,
            Action::Message { message_type: None, client_ref: None, .. }
        ));
    }

    #[test]
    fn event_uses_t_tag() {
        let ev = Event::UserOffline {
            user_id: Uuid::nil(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["t"], "user_offline");
        assert_eq!(v["user_id"], Uuid::nil().to_string());
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        assert_eq!(MessageType::parse("image"), Some(MessageType::Image));
        assert_eq!(MessageType::parse("video"), None);
        assert_eq!(DeliveryStatus::parse("failed"), Some(DeliveryStatus::Failed));
    }
}
