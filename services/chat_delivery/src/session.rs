use chat_protocol::{Action, Event};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::ChatError;
use crate::hub::SessionHandle;
use crate::service::{parse_message_type, ChatService};

/// Lifecycle of an upgraded connection. Connecting and authenticating happen
/// before the upgrade, so a session starts out authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Authenticated,
    Subscribed,
    Disconnected,
}

/// Changes to routing state requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Subscribe(Uuid),
    Unsubscribe(Uuid),
    AnnounceOnline,
}

/// What handling one action produced.
#[derive(Debug, Default)]
pub struct Outcome {
    pub effects: Vec<Effect>,
    pub reply: Option<Event>,
}

impl Outcome {
    pub fn reply(event: Event) -> Self {
        Self {
            effects: Vec::new(),
            reply: Some(event),
        }
    }

    pub fn error(err: &ChatError, client_ref: Option<String>) -> Self {
        Self::reply(Event::Error {
            code: err.code().to_string(),
            message: err.message(),
            client_ref,
        })
    }
}

pub struct Session {
    identity: Identity,
    handle: SessionHandle,
    state: SessionState,
    announced: bool,
}

impl Session {
    pub fn new(identity: Identity, handle: SessionHandle) -> Self {
        Self {
            identity,
            handle,
            state: SessionState::Authenticated,
            announced: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Handle one action. Store work happens here; routing changes are
    /// returned as effects for [`Session::apply`].
    pub async fn dispatch(&self, svc: &ChatService, action: Action) -> Outcome {
        let who = &self.identity;
        match action {
            Action::Join => match svc.joined_channels(who).await {
                Ok(channels) => {
                    let mut effects: Vec<Effect> =
                        channels.iter().map(|c| Effect::Subscribe(c.channel_id)).collect();
                    if !self.announced {
                        effects.push(Effect::AnnounceOnline);
                    }
                    Outcome {
                        effects,
                        reply: Some(Event::Joined { channels }),
                    }
                }
                Err(e) => Outcome::error(&e, None),
            },
            Action::JoinChannel { channel_id } => {
                match svc.authorize_subscription(&self.handle, channel_id).await {
                    Ok(()) => Outcome {
                        effects: vec![Effect::Subscribe(channel_id)],
                        reply: Some(Event::ChannelJoined { channel_id }),
                    },
                    Err(e) => Outcome::error(&e, None),
                }
            }
            Action::LeaveChannel { channel_id } => Outcome {
                effects: vec![Effect::Unsubscribe(channel_id)],
                reply: Some(Event::ChannelLeft { channel_id }),
            },
            Action::Message {
                channel_id,
                content,
                message_type,
                client_ref,
            } => {
                let kind = match parse_message_type(message_type.as_deref()) {
                    Ok(kind) => kind,
                    Err(e) => return Outcome::error(&e, client_ref),
                };
                match svc.send_message(who, channel_id, content, kind).await {
                    Ok(sent) => Outcome::reply(Event::Sent {
                        message_id: sent.message.id,
                        client_ref,
                        degraded: sent.report.degraded,
                    }),
                    Err(e) => Outcome::error(&e, client_ref),
                }
            }
            Action::MessageRead { message_id } => match svc.mark_read(who, message_id).await {
                Ok(read) => Outcome::reply(Event::Read {
                    message_id,
                    newly_read: read.newly_read,
                }),
                Err(e) => Outcome::error(&e, None),
            },
            Action::Ack { message_id } => match svc.ack(who, message_id).await {
                Ok(_) => Outcome::default(),
                Err(e) => Outcome::error(&e, None),
            },
        }
    }

    /// Apply an outcome: routing effects first, then the reply.
    ///
    /// Subscriptions re-check membership, so a removal that landed after
    /// `dispatch` wins. A refused subscription turns a `channel_joined` reply
    /// into an error and drops the channel from a `joined` reply.
    pub async fn apply(&mut self, svc: &ChatService, outcome: Outcome) {
        let hub = svc.hub();
        let mut reply = outcome.reply;
        for effect in outcome.effects {
            match effect {
                Effect::Subscribe(channel_id) => match svc.subscribe_session(&self.handle, channel_id).await {
                    Ok(()) => self.state = SessionState::Subscribed,
                    Err(e) => {
                        tracing::debug!(%channel_id, user_id = %self.identity.user_id, error = %e, "subscription refused");
                        reply = match reply {
                            Some(Event::ChannelJoined { .. }) => Outcome::error(&e, None).reply,
                            Some(Event::Joined { mut channels }) => {
                                channels.retain(|c| c.channel_id != channel_id);
                                Some(Event::Joined { channels })
                            }
                            other => other,
                        };
                    }
                },
                Effect::Unsubscribe(channel_id) => {
                    hub.unsubscribe(&channel_id, self.handle.conn_id);
                }
                Effect::AnnounceOnline => {
                    self.announced = true;
                    self.state = SessionState::Subscribed;
                    if svc.presence().connect(self.identity.user_id) {
                        hub.broadcast_org(
                            &self.identity.organization_id,
                            &Event::UserOnline {
                                user_id: self.identity.user_id,
                                username: self.identity.username.clone(),
                            },
                            Some(&self.identity.user_id),
                        );
                    }
                }
            }
        }
        if let Some(reply) = reply {
            self.handle.send(reply);
        }
    }

    /// Tear the connection down. Offline is announced after the presence
    /// debounce, and only if no other session came back in the meantime.
    pub fn close(&mut self, svc: &ChatService) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.state = SessionState::Disconnected;
        svc.hub().unregister(&self.handle);
        if !self.announced {
            return;
        }
        let presence = svc.presence().clone();
        let hub = svc.hub().clone();
        let user_id = self.identity.user_id;
        let org = self.identity.organization_id;
        tokio::spawn(async move {
            if presence.disconnect(user_id).await {
                hub.broadcast_org(&org, &Event::UserOffline { user_id }, Some(&user_id));
                tracing::debug!(%user_id, "user offline");
            }
        });
    }
}
