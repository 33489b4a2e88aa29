//! Authorization and realtime side effects around the stores.
//!
//! HTTP handlers and realtime sessions both go through [`ChatService`], so a
//! send over either path is persisted, published and fanned out the same way.

use chat_protocol::{ChannelUnread, Event, StatusKind};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::delivery::{self, Transition};
use crate::error::{ChatError, ChatResult};
use crate::fanout::{self, FanoutPolicy, FanoutReport};
use crate::hub::{Hub, SessionHandle};
use crate::messages::Cursor;
use crate::model::{
    Channel, ChannelStats, ChannelSummary, ChannelType, DeliveryLog, DeliveryStatus, Membership,
    Message, MessageType, Notification, ReadReceipt,
};
use crate::presence::Presence;
use crate::receipts::ReadOutcome;
use crate::store::Store;
use crate::{channels, members, messages, notifications, receipts};

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub report: FanoutReport,
}

#[derive(Clone)]
pub struct ChatService {
    store: Store,
    hub: Arc<Hub>,
    presence: Arc<Presence>,
    fanout: FanoutPolicy,
}

/// Parse a wire message type, defaulting to text.
pub fn parse_message_type(raw: Option<&str>) -> ChatResult<MessageType> {
    match raw {
        None => Ok(MessageType::Text),
        Some(s) => MessageType::parse(s).ok_or(ChatError::InvalidInput("message_type")),
    }
}

fn require_owner(channel: &Channel, who: &Identity) -> ChatResult<()> {
    if channel.owner_id != who.user_id {
        return Err(ChatError::Forbidden);
    }
    Ok(())
}

impl ChatService {
    pub fn new(store: Store, hub: Arc<Hub>, presence: Arc<Presence>, fanout: FanoutPolicy) -> Self {
        Self {
            store,
            hub,
            presence,
            fanout,
        }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn presence(&self) -> &Arc<Presence> {
        &self.presence
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn create_channel(&self, who: &Identity, name: String, channel_type: ChannelType) -> ChatResult<Channel> {
        let (org, owner) = (who.organization_id, who.user_id);
        let channel = self
            .store
            .run(move |conn| channels::create_channel(conn, &org, &owner, &name, channel_type))
            .await?;
        self.hub.subscribe_user(&channel.id, &owner);
        tracing::info!(channel_id = %channel.id, owner_id = %owner, "channel created");
        Ok(channel)
    }

    pub async fn list_channels(&self, who: &Identity) -> ChatResult<Vec<ChannelSummary>> {
        let user = who.user_id;
        self.store
            .run(move |conn| channels::list_channels_for_user(conn, &user))
            .await
    }

    pub async fn get_channel(&self, who: &Identity, channel_id: Uuid) -> ChatResult<Channel> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)?;
                Ok(channel)
            })
            .await
    }

    pub async fn update_channel(
        &self,
        who: &Identity,
        channel_id: Uuid,
        name: Option<String>,
        channel_type: Option<ChannelType>,
    ) -> ChatResult<Channel> {
        let who = who.clone();
        self.store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                require_owner(&channel, &who)?;
                channels::update_channel(conn, &channel_id, name.as_deref(), channel_type)
            })
            .await
    }

    pub async fn archive_channel(&self, who: &Identity, channel_id: Uuid) -> ChatResult<Channel> {
        let who = who.clone();
        self.store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                require_owner(&channel, &who)?;
                channels::archive_channel(conn, &channel_id)
            })
            .await
    }

    pub async fn delete_channel(&self, who: &Identity, channel_id: Uuid) -> ChatResult<()> {
        let actor = who.clone();
        self.store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                require_owner(&channel, &actor)?;
                channels::delete_channel(conn, &channel_id)
            })
            .await?;
        self.hub.publish(&channel_id, &Event::ChannelLeft { channel_id });
        self.hub.drop_group(&channel_id);
        tracing::info!(%channel_id, user_id = %who.user_id, "channel deleted");
        Ok(())
    }

    pub async fn channel_stats(&self, who: &Identity, channel_id: Uuid) -> ChatResult<ChannelStats> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                let stats = channels::channel_stats(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)?;
                Ok(stats)
            })
            .await
    }

    pub async fn list_members(&self, who: &Identity, channel_id: Uuid) -> ChatResult<Vec<Membership>> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)?;
                members::list_active_members(conn, &channel_id)
            })
            .await
    }

    /// Membership changes and subscriptions of the channel serialize on the
    /// channel lock, so routing never lags behind the committed membership.
    pub async fn add_member(&self, who: &Identity, channel_id: Uuid, user_id: Uuid) -> ChatResult<Membership> {
        let actor = who.user_id;
        let _routing = self.hub.channel_lock(&channel_id).await;
        let membership = self
            .store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &actor)?;
                if channel.is_archived {
                    return Err(ChatError::Conflict("channel_archived"));
                }
                members::add_member(conn, &channel_id, &user_id)
            })
            .await?;
        self.hub.subscribe_user(&channel_id, &user_id);
        self.hub
            .publish(&channel_id, &Event::MemberJoined { channel_id, user_id });
        tracing::info!(%channel_id, %user_id, added_by = %actor, "member added");
        Ok(membership)
    }

    pub async fn remove_member(&self, who: &Identity, channel_id: Uuid, user_id: Uuid) -> ChatResult<Membership> {
        let actor = who.user_id;
        let _routing = self.hub.channel_lock(&channel_id).await;
        let membership = self
            .store
            .run(move |conn| {
                let channel = channels::get_channel(conn, &channel_id)?;
                if actor != user_id && channel.owner_id != actor {
                    return Err(ChatError::Forbidden);
                }
                members::remove_member(conn, &channel_id, &user_id)
            })
            .await?;
        self.hub
            .publish(&channel_id, &Event::MemberLeft { channel_id, user_id });
        self.hub.unsubscribe_user(&channel_id, &user_id);
        self.hub
            .notify_user(&user_id, &Event::ChannelLeft { channel_id });
        tracing::info!(%channel_id, %user_id, removed_by = %actor, "member removed");
        Ok(membership)
    }

    pub async fn list_messages(
        &self,
        who: &Identity,
        channel_id: Uuid,
        before: Option<Cursor>,
        limit: Option<usize>,
    ) -> ChatResult<Vec<Message>> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)?;
                messages::list_messages(conn, &channel_id, before, messages::page_size(limit))
            })
            .await
    }

    /// Persist, publish and fan out a message.
    ///
    /// The channel lock is held from the insert until the publish, so every
    /// subscriber sees the channel's messages in commit order. Delivery logs
    /// and notifications are written with the message; when that part fails
    /// they are retried after the lock is released, which can degrade the
    /// send but never fail it.
    pub async fn send_message(
        &self,
        who: &Identity,
        channel_id: Uuid,
        content: String,
        message_type: MessageType,
    ) -> ChatResult<SendOutcome> {
        let sender = who.user_id;
        let sender_name = who.username.clone();
        let sent = {
            let _order = self.hub.channel_lock(&channel_id).await;
            let sent = self
                .store
                .run(move |conn| {
                    messages::send_message(conn, &channel_id, &sender, &sender_name, &content, message_type)
                })
                .await?;
            let reached = self.hub.publish(
                &channel_id,
                &Event::Message {
                    message: sent.message.clone(),
                    delivery_status: DeliveryStatus::Delivered,
                },
            );
            tracing::debug!(message_id = %sent.message.id, %channel_id, reached, "message published");
            sent
        };

        let messages::Sent {
            message,
            snapshot,
            deliveries,
            notifications: notified,
            fanout_error,
        } = sent;
        let report = match fanout_error {
            None => FanoutReport {
                deliveries,
                notifications: notified,
                attempts: 1,
                degraded: false,
            },
            Some(e) => {
                tracing::warn!(message_id = %message.id, error = %e, "fanout not written with message, retrying");
                fanout::run(&self.store, &self.fanout, &message, &snapshot).await
            }
        };
        if report.degraded {
            self.echo_failed(&message).await;
        }
        tracing::info!(
            message_id = %message.id,
            %channel_id,
            recipients = snapshot.len().saturating_sub(1),
            degraded = report.degraded,
            "message sent"
        );
        Ok(SendOutcome { message, report })
    }

    async fn echo_failed(&self, message: &Message) {
        let id = message.id;
        let logs = match self.store.run(move |conn| delivery::get_delivery_logs(conn, &id)).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "could not load delivery logs");
                return;
            }
        };
        for log in logs.iter().filter(|l| l.status == DeliveryStatus::Failed) {
            self.hub.notify_user(
                &message.sender_id,
                &Event::MessageStatus {
                    message_id: id,
                    recipient_id: log.recipient_id,
                    status: StatusKind::Failed,
                    read_by: None,
                },
            );
        }
    }

    pub async fn edit_message(&self, who: &Identity, message_id: Uuid, content: String) -> ChatResult<Message> {
        let editor = who.user_id;
        let message = self
            .store
            .run(move |conn| messages::edit_message(conn, &message_id, &editor, &content))
            .await?;
        self.hub.publish(
            &message.channel_id,
            &Event::MessageEdited {
                message: message.clone(),
            },
        );
        Ok(message)
    }

    pub async fn delete_message(&self, who: &Identity, message_id: Uuid) -> ChatResult<Message> {
        let actor = who.user_id;
        let message = self
            .store
            .run(move |conn| messages::delete_message(conn, &message_id, &actor))
            .await?;
        self.hub.publish(
            &message.channel_id,
            &Event::MessageDeleted {
                message_id,
                channel_id: message.channel_id,
            },
        );
        tracing::info!(%message_id, channel_id = %message.channel_id, "message deleted");
        Ok(message)
    }

    /// Mark a message read and tell the sender's sessions when it is new.
    pub async fn mark_read(&self, who: &Identity, message_id: Uuid) -> ChatResult<ReadOutcome> {
        let reader = who.user_id;
        let outcome = self
            .store
            .run(move |conn| receipts::mark_message_as_read(conn, &message_id, &reader))
            .await?;
        if outcome.newly_read && outcome.message.sender_id != reader {
            self.hub.notify_user(
                &outcome.message.sender_id,
                &Event::MessageStatus {
                    message_id,
                    recipient_id: reader,
                    status: StatusKind::Read,
                    read_by: Some(reader),
                },
            );
        }
        Ok(outcome)
    }

    /// Recipient acknowledgement: move the caller's delivery row to delivered.
    ///
    /// Only recipients in the send-time snapshot have a row; anyone else gets
    /// `NotFound`.
    pub async fn ack(&self, who: &Identity, message_id: Uuid) -> ChatResult<Transition> {
        let recipient = who.user_id;
        let (message, transition) = self
            .store
            .run(move |conn| {
                let message = messages::get_live_message(conn, &message_id)?;
                let transition =
                    delivery::update_delivery_status(conn, &message_id, &recipient, DeliveryStatus::Delivered, None)?;
                Ok((message, transition))
            })
            .await?;
        if transition.changed {
            self.hub.notify_user(
                &message.sender_id,
                &Event::MessageStatus {
                    message_id,
                    recipient_id: recipient,
                    status: StatusKind::Delivered,
                    read_by: None,
                },
            );
        }
        Ok(transition)
    }

    pub async fn delivery_logs(&self, who: &Identity, message_id: Uuid) -> ChatResult<Vec<DeliveryLog>> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                let message = messages::get_message(conn, &message_id)?;
                members::require_active_member(conn, &message.channel_id, &user)?;
                delivery::get_delivery_logs(conn, &message_id)
            })
            .await
    }

    pub async fn read_receipts(&self, who: &Identity, message_id: Uuid) -> ChatResult<Vec<ReadReceipt>> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                let message = messages::get_message(conn, &message_id)?;
                members::require_active_member(conn, &message.channel_id, &user)?;
                receipts::get_message_read_receipts(conn, &message_id)
            })
            .await
    }

    pub async fn unread_notifications(&self, who: &Identity) -> ChatResult<Vec<Notification>> {
        let user = who.user_id;
        self.store
            .run(move |conn| notifications::get_unread_notifications(conn, &user))
            .await
    }

    pub async fn mark_notification_read(&self, who: &Identity, id: Uuid) -> ChatResult<Notification> {
        let user = who.user_id;
        self.store
            .run(move |conn| notifications::mark_notification_as_read(conn, &id, &user))
            .await
    }

    pub async fn mark_channel_notifications_read(&self, who: &Identity, channel_id: Uuid) -> ChatResult<usize> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                channels::get_channel(conn, &channel_id)?;
                notifications::mark_all_notifications_as_read(conn, &user, &channel_id)
            })
            .await
    }

    /// Channels a session should subscribe to on `join`, with unread counts.
    pub async fn joined_channels(&self, who: &Identity) -> ChatResult<Vec<ChannelUnread>> {
        let summaries = self.list_channels(who).await?;
        Ok(summaries
            .into_iter()
            .map(|s| ChannelUnread {
                channel_id: s.channel.id,
                unread: s.unread_count,
            })
            .collect())
    }

    /// Unread notifications of the caller in one channel.
    pub async fn unread_count(&self, who: &Identity, channel_id: Uuid) -> ChatResult<u32> {
        let user = who.user_id;
        self.store
            .run(move |conn| {
                channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)?;
                notifications::unread_count(conn, &user, &channel_id)
            })
            .await
    }

    /// Subscribe a session to a channel group after checking membership under
    /// the channel lock.
    pub async fn subscribe_session(&self, session: &SessionHandle, channel_id: Uuid) -> ChatResult<()> {
        let _routing = self.hub.channel_lock(&channel_id).await;
        self.authorize_subscription(session, channel_id).await?;
        self.hub.subscribe(&channel_id, session);
        Ok(())
    }

    /// Check that the session's user may subscribe to `channel_id`.
    pub async fn authorize_subscription(&self, session: &SessionHandle, channel_id: Uuid) -> ChatResult<()> {
        let user = session.user_id;
        self.store
            .run(move |conn| {
                channels::get_channel(conn, &channel_id)?;
                members::require_active_member(conn, &channel_id, &user)
            })
            .await
    }
}
