//! Shared fakes for worker tests.

use std::sync::Mutex;

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::dispatch::PushProvider;
use crate::gmail::MailboxClient;
use crate::models::{MessageSummary, PushNotification};
use crate::notifier::IndexSink;

/// Push provider that records every call and answers with a configured
/// invalid-token list, or an error.
#[derive(Default)]
pub struct FakePush {
    invalid: Vec<String>,
    fail: bool,
    calls: Mutex<Vec<(Vec<String>, PushNotification)>>,
}

impl FakePush {
    pub fn reporting_invalid(tokens: &[&str]) -> Self {
        Self {
            invalid: tokens.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(Vec<String>, PushNotification)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PushProvider for FakePush {
    async fn send_to_devices(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .push((tokens.to_vec(), notification.clone()));
        if self.fail {
            return Err(anyhow!("provider unavailable"));
        }
        Ok(self
            .invalid
            .iter()
            .filter(|t| tokens.contains(t))
            .cloned()
            .collect())
    }
}

/// Mailbox client that serves a canned latest message and records label
/// modifications.
#[derive(Default)]
pub struct FakeMailbox {
    latest: Option<MessageSummary>,
    fail: bool,
    modifications: Mutex<Vec<(String, String, Vec<String>, Vec<String>)>>,
}

impl FakeMailbox {
    pub fn with_message(from: &str, subject: &str) -> Self {
        Self {
            latest: Some(MessageSummary {
                id: "msg-latest".to_string(),
                from_address: Some(from.to_string()),
                from_name: None,
                subject: Some(subject.to_string()),
            }),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn modifications(&self) -> Vec<(String, String, Vec<String>, Vec<String>)> {
        self.modifications.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxClient for FakeMailbox {
    async fn latest_message(&self, _user_email: &str) -> Result<Option<MessageSummary>> {
        if self.fail {
            return Err(anyhow!("mailbox unavailable"));
        }
        Ok(self.latest.clone())
    }

    async fn modify_labels(
        &self,
        user_email: &str,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        if self.fail {
            return Err(anyhow!("mailbox unavailable"));
        }
        self.modifications.lock().unwrap().push((
            user_email.to_string(),
            message_id.to_string(),
            add.to_vec(),
            remove.to_vec(),
        ));
        Ok(())
    }
}

/// Index sink that records what was enqueued.
#[derive(Default)]
pub struct RecordingIndexer {
    enqueued: Mutex<Vec<(i64, String)>>,
}

impl RecordingIndexer {
    pub fn enqueued(&self) -> Vec<(i64, String)> {
        self.enqueued.lock().unwrap().clone()
    }
}

#[async_trait]
impl IndexSink for RecordingIndexer {
    async fn enqueue(&self, user_id: i64, message: &MessageSummary) {
        self.enqueued
            .lock()
            .unwrap()
            .push((user_id, message.id.clone()));
    }
}
