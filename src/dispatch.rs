//! Fan-out to live connections and mobile push tokens.
//!
//! Live delivery is best-effort: an event for a user with no open connection
//! is dropped, never buffered. Push delivery goes through a [`PushProvider`]
//! which reports permanently invalid tokens back so callers can prune them;
//! the channel itself never retries.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::PushNotification;

/// An event delivered to a user's open connections.
#[derive(Debug, Clone, Serialize)]
pub struct LiveEvent {
    pub event: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait PushProvider: Send + Sync {
    /// Attempts delivery to every token. Returns the subset the provider
    /// flagged as permanently invalid (unregistered device, bad token).
    /// Transient per-token failures are not reported here.
    async fn send_to_devices(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<Vec<String>>;
}

pub struct Dispatcher {
    connections: RwLock<HashMap<i64, Vec<mpsc::UnboundedSender<LiveEvent>>>>,
    push: Option<Arc<dyn PushProvider>>,
}

impl Dispatcher {
    pub fn new(push: Option<Arc<dyn PushProvider>>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            push,
        }
    }

    pub fn push_enabled(&self) -> bool {
        self.push.is_some()
    }

    /// Registers a live connection for a user. The connection stays
    /// registered until the returned receiver is dropped; it is pruned
    /// lazily on the next send.
    pub fn subscribe(&self, user_id: i64) -> mpsc::UnboundedReceiver<LiveEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut connections) = self.connections.write() {
            connections.entry(user_id).or_default().push(tx);
        }
        rx
    }

    /// Sends an event to every open connection of a user. Silently a no-op
    /// when there are none.
    pub fn notify_user(&self, user_id: i64, event: &str, data: serde_json::Value) {
        let Ok(mut connections) = self.connections.write() else {
            return;
        };
        let Some(senders) = connections.get_mut(&user_id) else {
            return;
        };
        let live = LiveEvent {
            event: event.to_string(),
            data,
        };
        senders.retain(|tx| tx.send(live.clone()).is_ok());
        if senders.is_empty() {
            connections.remove(&user_id);
        }
    }

    /// Push fan-out. Returns the tokens the provider reported invalid; the
    /// caller owns pruning them from the token store.
    pub async fn push_to_devices(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<Vec<String>> {
        match &self.push {
            Some(provider) => provider.send_to_devices(tokens, notification).await,
            None => {
                debug!("push provider not configured, dropping notification");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePush;

    #[tokio::test]
    async fn notify_without_connections_is_a_noop() {
        let dispatch = Dispatcher::new(None);
        dispatch.notify_user(1, "new_mail", serde_json::json!({}));
    }

    #[tokio::test]
    async fn notify_reaches_every_connection_of_the_user() {
        let dispatch = Dispatcher::new(None);
        let mut rx_a = dispatch.subscribe(1);
        let mut rx_b = dispatch.subscribe(1);
        let mut rx_other = dispatch.subscribe(2);

        dispatch.notify_user(1, "email_woken", serde_json::json!({"emailId": "m1"}));

        assert_eq!(rx_a.recv().await.unwrap().event, "email_woken");
        assert_eq!(rx_b.recv().await.unwrap().event, "email_woken");
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_send() {
        let dispatch = Dispatcher::new(None);
        let rx = dispatch.subscribe(1);
        drop(rx);

        dispatch.notify_user(1, "new_mail", serde_json::json!({}));

        let connections = dispatch.connections.read().unwrap();
        assert!(!connections.contains_key(&1));
    }

    #[tokio::test]
    async fn push_without_provider_reports_nothing_invalid() {
        let dispatch = Dispatcher::new(None);
        let invalid = dispatch
            .push_to_devices(
                &["tok".to_string()],
                &PushNotification {
                    title: "t".to_string(),
                    body: "b".to_string(),
                    data: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();
        assert!(invalid.is_empty());
    }

    #[tokio::test]
    async fn push_surfaces_provider_invalid_tokens() {
        let push = Arc::new(FakePush::reporting_invalid(&["bad"]));
        let dispatch = Dispatcher::new(Some(push.clone()));

        let invalid = dispatch
            .push_to_devices(
                &["good".to_string(), "bad".to_string()],
                &PushNotification {
                    title: "t".to_string(),
                    body: "b".to_string(),
                    data: serde_json::Value::Null,
                },
            )
            .await
            .unwrap();

        assert_eq!(invalid, vec!["bad".to_string()]);
        assert_eq!(push.call_count(), 1);
    }
}
