//! Task reminder worker.
//!
//! Polls the reminder store for due tasks and pushes one notification per
//! task to every device the owner has registered. Delivery is attempted at
//! most once: `reminder_sent` is set after the first attempt whatever the
//! provider said, trading a silently dropped reminder on provider failure
//! for immunity to re-delivery storms.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::models::{PushNotification, ReminderTask};

pub struct ReminderWorker {
    db: Arc<Database>,
    dispatch: Arc<Dispatcher>,
    interval: Duration,
}

impl ReminderWorker {
    pub fn new(db: Arc<Database>, dispatch: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            db,
            dispatch,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "task reminder worker started");
        loop {
            self.tick(Utc::now().timestamp()).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("task reminder worker stopped");
    }

    /// Processes every due reminder once. Returns how many were marked sent.
    pub async fn tick(&self, now: i64) -> usize {
        let due = match self.db.due_reminders(now).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(error = %err, "due reminder query failed");
                return 0;
            }
        };

        let mut handled = 0;
        for task in due {
            if let Err(err) = self.deliver(&task).await {
                warn!(task_id = task.id, error = %err, "reminder delivery failed");
            }
            // Marked sent no matter how delivery went; the failure above was
            // this reminder's one attempt.
            match self.db.mark_reminder_sent(task.id).await {
                Ok(()) => handled += 1,
                Err(err) => {
                    warn!(task_id = task.id, error = %err, "failed to mark reminder sent");
                }
            }
        }
        handled
    }

    async fn deliver(&self, task: &ReminderTask) -> Result<()> {
        let tokens = self.db.push_tokens(task.user_id).await?;
        if tokens.is_empty() {
            debug!(task_id = task.id, "no push tokens registered, skipping reminder");
            return Ok(());
        }

        let notification = build_notification(task);
        let token_strings: Vec<String> = tokens.into_iter().map(|t| t.token).collect();
        let invalid = self
            .dispatch
            .push_to_devices(&token_strings, &notification)
            .await?;
        if !invalid.is_empty() {
            self.db.delete_push_tokens(task.user_id, &invalid).await?;
            info!(
                user_id = task.user_id,
                count = invalid.len(),
                "pruned invalid push tokens"
            );
        }
        Ok(())
    }
}

/// Builds the push payload for a due reminder.
fn build_notification(task: &ReminderTask) -> PushNotification {
    let marker = match task.priority.as_str() {
        "high" => "❗ ",
        _ => "",
    };
    let title = format!("{}Reminder: {}", marker, task.title);

    let mut body = task
        .description
        .clone()
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "You asked to be reminded about this task.".to_string());
    if let Some(due_at) = task.due_at {
        if let Some(due) = chrono::DateTime::from_timestamp(due_at, 0) {
            body.push_str(&format!(" (due {})", due.format("%b %-d, %H:%M")));
        }
    }

    PushNotification {
        title,
        body,
        data: serde_json::json!({"taskId": task.id, "emailId": task.email_id}),
    }
}
