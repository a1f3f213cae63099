//! Snooze wake worker.
//!
//! A levelled poll over the mapping store, not an event queue: every tick it
//! scans the snoozed rows across all users and restores the ones whose wake
//! time has passed. A missed tick only delays a wake until the next scan,
//! and an email the user un-snoozed mid-scan is simply no longer in the
//! snoozed column when its row comes up.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::gmail::MailboxClient;
use crate::models::{COLUMN_INBOX, SnoozedMapping};

pub struct WakeWorker {
    db: Arc<Database>,
    dispatch: Arc<Dispatcher>,
    mailbox: Option<Arc<dyn MailboxClient>>,
    interval: Duration,
}

impl WakeWorker {
    pub fn new(
        db: Arc<Database>,
        dispatch: Arc<Dispatcher>,
        mailbox: Option<Arc<dyn MailboxClient>>,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            dispatch,
            mailbox,
            interval,
        }
    }

    /// Ticks immediately, then on the configured interval until cancelled.
    /// An in-flight tick always finishes.
    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "snooze wake worker started");
        loop {
            self.tick(Utc::now().timestamp()).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("snooze wake worker stopped");
    }

    /// Runs one scan. Returns the number of mappings restored; a failure on
    /// one row is logged and never blocks the rest of the scan.
    pub async fn tick(&self, now: i64) -> usize {
        let snoozed = match self.db.list_all_snoozed().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "snoozed scan failed");
                return 0;
            }
        };

        let mut woken = 0;
        for row in snoozed {
            if row.snoozed_until > now {
                continue;
            }
            match self.wake(&row).await {
                Ok(column) => {
                    woken += 1;
                    debug!(
                        user_id = row.user_id,
                        email_id = %row.email_id,
                        column = %column,
                        "restored snoozed email"
                    );
                }
                Err(err) => {
                    warn!(
                        user_id = row.user_id,
                        email_id = %row.email_id,
                        error = %err,
                        "failed to wake snoozed email"
                    );
                }
            }
        }
        woken
    }

    async fn wake(&self, row: &SnoozedMapping) -> Result<String> {
        let target = if row.previous_column_id.is_empty() {
            COLUMN_INBOX.to_string()
        } else {
            row.previous_column_id.clone()
        };

        self.db.set_column(row.user_id, &row.email_id, &target).await?;
        self.sync_labels(row, &target).await;
        self.dispatch.notify_user(
            row.user_id,
            "email_woken",
            serde_json::json!({"emailId": row.email_id, "columnId": target}),
        );
        Ok(target)
    }

    /// Mirrors the restore onto Gmail when the target column carries a label
    /// policy. Best effort: the store is already correct, so a provider
    /// failure only costs label drift until the next move.
    async fn sync_labels(&self, row: &SnoozedMapping, target: &str) {
        let Some(client) = &self.mailbox else {
            return;
        };

        let column = match self.db.column(row.user_id, target).await {
            Ok(column) => column,
            Err(err) => {
                warn!(user_id = row.user_id, error = %err, "column lookup failed");
                return;
            }
        };
        let Some(column) = column else {
            return;
        };
        if column.gmail_label_add.is_none() && column.gmail_labels_remove.is_empty() {
            return;
        }

        let address = match self.db.user_email(row.user_id).await {
            Ok(Some(address)) => address,
            Ok(None) => return,
            Err(err) => {
                warn!(user_id = row.user_id, error = %err, "user lookup failed");
                return;
            }
        };

        let add: Vec<String> = column.gmail_label_add.clone().into_iter().collect();
        if let Err(err) = client
            .modify_labels(&address, &row.email_id, &add, &column.gmail_labels_remove)
            .await
        {
            warn!(
                user_id = row.user_id,
                email_id = %row.email_id,
                error = %err,
                "label sync failed after wake"
            );
        }
    }
}
