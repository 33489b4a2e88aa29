use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::db::write_tx;
use crate::error::{ChatError, ChatResult};
use crate::model::Message;
use crate::store::Store;
use crate::{delivery, notifications};

/// Retry settings for a fanout that has to be redone after the send.
#[derive(Clone, Copy, Debug)]
pub struct FanoutPolicy {
    pub attempts: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for FanoutPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub deliveries: usize,
    pub notifications: usize,
    pub attempts: u32,
    /// Set when the fanout gave up and recorded the rest as failed.
    pub degraded: bool,
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts.
///
/// Only transient errors are retried. Returns the number of attempts made
/// alongside the outcome.
pub async fn retry<T, F, Fut>(policy: &FanoutPolicy, mut op: F) -> (ChatResult<T>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ChatResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %e, "fanout attempt failed, retrying");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

/// Write delivery logs and notifications for `recipients` after the send
/// could not write them with the message.
///
/// Both inserts share a transaction and ignore rows that already exist, so
/// each retry only fills what is missing. On exhaustion the remaining
/// recipients are recorded as failed and the report is marked degraded.
pub async fn run(store: &Store, policy: &FanoutPolicy, message: &Message, recipients: &[Uuid]) -> FanoutReport {
    let (result, attempts) = retry(policy, || {
        let message = message.clone();
        let recipients = recipients.to_vec();
        store.run(move |conn| {
            let tx = write_tx(conn)?;
            let deliveries = delivery::fanout_deliveries(&tx, &message, &recipients)?;
            let notifications = notifications::fanout_notifications(&tx, &message, &recipients)?;
            tx.commit()?;
            Ok((deliveries, notifications))
        })
    })
    .await;

    match result {
        Ok((deliveries, notifications)) => FanoutReport {
            deliveries,
            notifications,
            attempts,
            degraded: false,
        },
        Err(e) => {
            tracing::warn!(message_id = %message.id, attempts, error = %e, "fanout exhausted");
            record_exhausted(store, message, recipients, e).await;
            FanoutReport {
                deliveries: 0,
                notifications: 0,
                attempts,
                degraded: true,
            }
        }
    }
}

async fn record_exhausted(store: &Store, message: &Message, recipients: &[Uuid], cause: ChatError) {
    let message = message.clone();
    let message_id = message.id;
    let recipients = recipients.to_vec();
    let error = cause.to_string();
    let recorded = store
        .run(move |conn| delivery::record_failed(conn, &message, &recipients, &error))
        .await;
    match recorded {
        Ok(n) => tracing::info!(%message_id, failed = n, "recorded failed deliveries"),
        Err(e) => tracing::error!(%message_id, error = %e, "could not record failed deliveries"),
    }
}
