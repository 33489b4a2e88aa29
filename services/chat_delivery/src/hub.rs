//! In-memory routing of realtime events.
//!
//! The hub knows which connections belong to which user and which
//! connections are subscribed to which channel. It never touches the store.

use chat_protocol::Event;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub type ConnId = u64;

/// Sending half of one live connection.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub conn_id: ConnId,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionHandle {
    /// Queue an event for the connection's writer. False once it is gone.
    pub fn send(&self, event: Event) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Default)]
struct ChannelGroup {
    subscribers: Mutex<HashMap<ConnId, SessionHandle>>,
    order: Arc<tokio::sync::Mutex<()>>,
}

type UserEntry = Arc<Mutex<HashMap<ConnId, SessionHandle>>>;

#[derive(Default)]
pub struct Hub {
    next_id: AtomicU64,
    users: RwLock<HashMap<Uuid, UserEntry>>,
    groups: RwLock<HashMap<Uuid, Arc<ChannelGroup>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection for `user_id` and hand back its event queue.
    pub fn register(&self, user_id: Uuid, organization_id: Uuid) -> (SessionHandle, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            conn_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            user_id,
            organization_id,
            tx,
        };
        let mut users = self.users.write();
        users
            .entry(user_id)
            .or_default()
            .lock()
            .insert(handle.conn_id, handle.clone());
        drop(users);
        (handle, rx)
    }

    /// Drop a connection from the user table and from every channel group.
    pub fn unregister(&self, handle: &SessionHandle) {
        {
            let mut users = self.users.write();
            if let Some(entry) = users.get(&handle.user_id).cloned() {
                let mut conns = entry.lock();
                conns.remove(&handle.conn_id);
                if conns.is_empty() {
                    users.remove(&handle.user_id);
                }
            }
        }
        let groups: Vec<Arc<ChannelGroup>> = self.groups.read().values().cloned().collect();
        for group in groups {
            group.subscribers.lock().remove(&handle.conn_id);
        }
    }

    fn group(&self, channel_id: &Uuid) -> Arc<ChannelGroup> {
        if let Some(group) = self.groups.read().get(channel_id) {
            return group.clone();
        }
        self.groups.write().entry(*channel_id).or_default().clone()
    }

    pub fn subscribe(&self, channel_id: &Uuid, handle: &SessionHandle) {
        self.group(channel_id)
            .subscribers
            .lock()
            .insert(handle.conn_id, handle.clone());
    }

    /// Returns false when the connection was not subscribed.
    pub fn unsubscribe(&self, channel_id: &Uuid, conn_id: ConnId) -> bool {
        let group = self.groups.read().get(channel_id).cloned();
        match group {
            Some(group) => group.subscribers.lock().remove(&conn_id).is_some(),
            None => false,
        }
    }

    /// Subscribe every live connection of `user_id`.
    pub fn subscribe_user(&self, channel_id: &Uuid, user_id: &Uuid) {
        for handle in self.sessions_of(user_id) {
            self.subscribe(channel_id, &handle);
        }
    }

    /// Unsubscribe every live connection of `user_id`. Returns how many were removed.
    pub fn unsubscribe_user(&self, channel_id: &Uuid, user_id: &Uuid) -> usize {
        let group = self.groups.read().get(channel_id).cloned();
        let Some(group) = group else { return 0 };
        let mut subs = group.subscribers.lock();
        let before = subs.len();
        subs.retain(|_, h| h.user_id != *user_id);
        before - subs.len()
    }

    /// Per-channel lock held across persist and publish.
    pub async fn channel_lock(&self, channel_id: &Uuid) -> tokio::sync::OwnedMutexGuard<()> {
        let order = self.group(channel_id).order.clone();
        order.lock_owned().await
    }

    /// Send to every subscriber of a channel. Returns the number reached.
    pub fn publish(&self, channel_id: &Uuid, event: &Event) -> usize {
        let group = self.groups.read().get(channel_id).cloned();
        let Some(group) = group else { return 0 };
        let targets: Vec<SessionHandle> = group.subscribers.lock().values().cloned().collect();
        targets.iter().filter(|h| h.send(event.clone())).count()
    }

    /// Send to every live connection of one user.
    pub fn notify_user(&self, user_id: &Uuid, event: &Event) -> usize {
        self.sessions_of(user_id)
            .iter()
            .filter(|h| h.send(event.clone()))
            .count()
    }

    /// Send to every connection in an organization, optionally skipping one user.
    pub fn broadcast_org(&self, organization_id: &Uuid, event: &Event, except: Option<&Uuid>) -> usize {
        let entries: Vec<UserEntry> = self.users.read().values().cloned().collect();
        let mut reached = 0;
        for entry in entries {
            let targets: Vec<SessionHandle> = entry
                .lock()
                .values()
                .filter(|h| h.organization_id == *organization_id && Some(&h.user_id) != except)
                .cloned()
                .collect();
            reached += targets.iter().filter(|h| h.send(event.clone())).count();
        }
        reached
    }

    /// Forget a channel group entirely. Used after a hard delete.
    pub fn drop_group(&self, channel_id: &Uuid) {
        self.groups.write().remove(channel_id);
    }

    pub fn sessions_of(&self, user_id: &Uuid) -> Vec<SessionHandle> {
        let entry = self.users.read().get(user_id).cloned();
        entry
            .map(|e| e.lock().values().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl Hub {
    pub fn is_connected(&self, user_id: &Uuid) -> bool {
        self.users.read().contains_key(user_id)
    }

    pub fn subscriber_count(&self, channel_id: &Uuid) -> usize {
        self.groups
            .read()
            .get(channel_id)
            .map(|g| g.subscribers.lock().len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offline(user_id: Uuid) -> Event {
        Event::UserOffline { user_id }
    }

    #[test]
    fn publish_reaches_subscribers_only() {
        let hub = Hub::new();
        let (org, channel) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, mut rx_a) = hub.register(Uuid::new_v4(), org);
        let (_b, mut rx_b) = hub.register(Uuid::new_v4(), org);
        hub.subscribe(&channel, &a);
        assert_eq!(hub.publish(&channel, &offline(a.user_id)), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        assert!(hub.unsubscribe(&channel, a.conn_id));
        assert!(!hub.unsubscribe(&channel, a.conn_id));
        assert_eq!(hub.publish(&channel, &offline(a.user_id)), 0);
    }

    #[test]
    fn unregister_clears_user_and_groups() {
        let hub = Hub::new();
        let user = Uuid::new_v4();
        let channel = Uuid::new_v4();
        let (h1, _rx1) = hub.register(user, Uuid::new_v4());
        let (h2, _rx2) = hub.register(user, h1.organization_id);
        hub.subscribe_user(&channel, &user);
        assert_eq!(hub.subscriber_count(&channel), 2);

        hub.unregister(&h1);
        assert!(hub.is_connected(&user));
        assert_eq!(hub.subscriber_count(&channel), 1);
        hub.unregister(&h2);
        assert!(!hub.is_connected(&user));
        assert_eq!(hub.subscriber_count(&channel), 0);
    }

    #[test]
    fn notify_and_org_broadcast() {
        let hub = Hub::new();
        let (org, other_org) = (Uuid::new_v4(), Uuid::new_v4());
        let me = Uuid::new_v4();
        let (_m1, mut rx1) = hub.register(me, org);
        let (_m2, mut rx2) = hub.register(me, org);
        let (_p, mut rx_peer) = hub.register(Uuid::new_v4(), org);
        let (_s, mut rx_stranger) = hub.register(Uuid::new_v4(), other_org);

        assert_eq!(hub.notify_user(&me, &offline(me)), 2);
        assert!(rx1.try_recv().is_ok() && rx2.try_recv().is_ok());

        assert_eq!(hub.broadcast_org(&org, &offline(me), Some(&me)), 1);
        assert!(rx_peer.try_recv().is_ok());
        assert!(rx_stranger.try_recv().is_err());
        assert!(rx1.try_recv().is_err());
    }

    #[test]
    fn unsubscribe_user_removes_all_connections() {
        let hub = Hub::new();
        let (user, channel) = (Uuid::new_v4(), Uuid::new_v4());
        let org = Uuid::new_v4();
        let _c1 = hub.register(user, org);
        let _c2 = hub.register(user, org);
        let (other, _rx) = hub.register(Uuid::new_v4(), org);
        hub.subscribe_user(&channel, &user);
        hub.subscribe(&channel, &other);
        assert_eq!(hub.unsubscribe_user(&channel, &user), 2);
        assert_eq!(hub.subscriber_count(&channel), 1);
    }

    #[tokio::test]
    async fn channel_lock_serializes_per_channel() {
        let hub = Arc::new(Hub::new());
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());
        let guard = hub.channel_lock(&c1).await;
        // other channels are independent
        let other = tokio::time::timeout(Duration::from_millis(50), hub.channel_lock(&c2)).await;
        assert!(other.is_ok());
        let same = tokio::time::timeout(Duration::from_millis(50), hub.channel_lock(&c1)).await;
        assert!(same.is_err());
        drop(guard);
        assert!(tokio::time::timeout(Duration::from_millis(50), hub.channel_lock(&c1))
            .await
            .is_ok());
    }
}
