use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;

/// Best-effort online tracking.
///
/// Each announced connection bumps a per-user count. The user goes offline
/// only when the count is still zero once the debounce has passed.
pub struct Presence {
    counts: Mutex<HashMap<Uuid, usize>>,
    debounce: Duration,
}

impl Presence {
    pub fn new(debounce: Duration) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Count one more connection. True for the user's first one.
    pub fn connect(&self, user_id: Uuid) -> bool {
        let mut counts = self.counts.lock();
        let live = counts.entry(user_id).or_default();
        *live += 1;
        *live == 1
    }

    /// Drop one connection and wait out the debounce. True when nobody came
    /// back, in which case the caller announces the user offline.
    pub async fn disconnect(&self, user_id: Uuid) -> bool {
        if let Some(live) = self.counts.lock().get_mut(&user_id) {
            *live = live.saturating_sub(1);
        }
        sleep(self.debounce).await;
        let mut counts = self.counts.lock();
        // a missing entry means another disconnect already reported it
        let offline = counts.get(&user_id) == Some(&0);
        if offline {
            counts.remove(&user_id);
        }
        offline
    }
}

#[cfg(test)]
impl Presence {
    pub fn is_online(&self, user_id: &Uuid) -> bool {
        self.counts.lock().get(user_id).is_some_and(|c| *c > 0)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        let guard = self.counts.lock();
        guard
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn state_machine() {
        let user = Uuid::new_v4();
        let presence = std::sync::Arc::new(Presence::new(Duration::from_millis(20)));
        assert!(presence.connect(user));
        let p = presence.clone();
        let fut = tokio::spawn(async move { p.disconnect(user).await });
        sleep(Duration::from_millis(10)).await;
        // reconnect before debounce expiry
        assert!(presence.connect(user));
        sleep(Duration::from_millis(30)).await;
        assert!(!fut.await.unwrap());
        assert!(presence.is_online(&user));
        // final disconnect
        assert!(presence.disconnect(user).await);
        assert!(presence.online_users().is_empty());
    }

    #[tokio::test]
    async fn second_session_keeps_user_online() {
        let user = Uuid::new_v4();
        let presence = Presence::new(Duration::from_millis(5));
        assert!(presence.connect(user));
        assert!(!presence.connect(user));
        assert!(!presence.disconnect(user).await);
        assert_eq!(presence.online_users(), vec![user]);
    }
}
