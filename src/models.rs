use serde::{Deserialize, Serialize};

/// Column every email starts in, and the fallback for any missing or
/// orphaned previous-column reference.
pub const COLUMN_INBOX: &str = "inbox";
/// Reserved column holding snoozed emails until their wake time.
pub const COLUMN_SNOOZED: &str = "snoozed";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ColumnAssignment {
    pub user_id: i64,
    pub email_id: String,
    pub column_id: String,
    pub previous_column_id: String,
    /// Unix seconds. Set exactly when `column_id` is `"snoozed"`.
    pub snoozed_until: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub user_id: i64,
    pub id: String,
    pub name: String,
    pub position: i64,
    /// Gmail label applied to an email when it lands in this column.
    pub gmail_label_add: Option<String>,
    /// Gmail labels removed when an email lands in this column.
    pub gmail_labels_remove: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReminderTask {
    pub id: i64,
    pub user_id: i64,
    pub email_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub due_at: Option<i64>,
    pub reminder_at: Option<i64>,
    pub reminder_sent: bool,
    pub priority: String, // 'low', 'normal' or 'high'
    pub status: String,   // 'todo', 'in_progress' or 'completed'
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PushToken {
    pub user_id: i64,
    pub token: String,
    pub device_info: Option<String>,
}

/// Row returned by the global snoozed scan. `snoozed_until` is non-optional
/// here: the query only matches rows in the snoozed column.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SnoozedMapping {
    pub user_id: i64,
    pub email_id: String,
    pub previous_column_id: String,
    pub snoozed_until: i64,
}

/// A provider "mailbox changed" event. Transient; only the dedup state
/// remembers it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub address: String,
    /// Monotonic per-mailbox counter (Gmail history id).
    pub history_id: u64,
}

/// The single latest message of a mailbox, fetched to enrich a push
/// notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub from_address: Option<String>,
    pub from_name: Option<String>,
    pub subject: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushNotification {
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}
