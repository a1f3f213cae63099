use anyhow::{Context, Result};
use sqlx::{Row, sqlite::SqlitePool};

use crate::models::{
    COLUMN_INBOX, COLUMN_SNOOZED, ColumnDefinition, PushToken, ReminderTask, SnoozedMapping,
};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// A single-connection in-memory database with the schema applied.
    /// SQLite drops an in-memory database with its last connection, so the
    /// pool must never grow past one.
    pub async fn in_memory() -> Result<Self> {
        use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    // ─── Users ───

    pub async fn insert_user(&self, email: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO users (email) VALUES (LOWER(?))")
            .bind(email)
            .execute(&self.pool)
            .await
            .context("Failed to insert user")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn user_id_for_address(&self, email: &str) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT id FROM users WHERE email = LOWER(?)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn user_email(&self, user_id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT email FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    // ─── Mapping store ───

    /// Assigns an email to a non-snooze column. Creates the row with an empty
    /// previous column when none exists; otherwise overwrites the column and
    /// clears any wake time, keeping the snooze invariant. Snoozing goes
    /// through `snooze_to`.
    pub async fn set_column(&self, user_id: i64, email_id: &str, column_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO column_assignments (user_id, email_id, column_id, previous_column_id, snoozed_until)
             VALUES (?, ?, ?, '', NULL)
             ON CONFLICT(user_id, email_id) DO UPDATE SET
                 column_id = excluded.column_id, snoozed_until = NULL",
        )
        .bind(user_id)
        .bind(email_id)
        .bind(column_id)
        .execute(&self.pool)
        .await
        .context("Failed to set column assignment")?;
        Ok(())
    }

    pub async fn snooze_to(
        &self,
        user_id: i64,
        email_id: &str,
        previous_column_id: &str,
        wake_at: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO column_assignments (user_id, email_id, column_id, previous_column_id, snoozed_until)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, email_id) DO UPDATE SET
                 column_id = excluded.column_id,
                 previous_column_id = excluded.previous_column_id,
                 snoozed_until = excluded.snoozed_until",
        )
        .bind(user_id)
        .bind(email_id)
        .bind(COLUMN_SNOOZED)
        .bind(previous_column_id)
        .bind(wake_at)
        .execute(&self.pool)
        .await
        .context("Failed to snooze email")?;
        Ok(())
    }

    /// The column an email returns to when un-snoozed. No row, or an empty
    /// stored value, resolves to the inbox.
    pub async fn previous_column(&self, user_id: i64, email_id: &str) -> Result<String> {
        let row = sqlx::query(
            "SELECT previous_column_id FROM column_assignments WHERE user_id = ? AND email_id = ?",
        )
        .bind(user_id)
        .bind(email_id)
        .fetch_optional(&self.pool)
        .await?;

        let previous: String = match row {
            Some(r) => r.get(0),
            None => String::new(),
        };
        if previous.is_empty() {
            Ok(COLUMN_INBOX.to_string())
        } else {
            Ok(previous)
        }
    }

    pub async fn list_by_column(&self, user_id: i64, column_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT email_id FROM column_assignments
             WHERE user_id = ? AND column_id = ?
             ORDER BY email_id ASC",
        )
        .bind(user_id)
        .bind(column_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.get(0)).collect())
    }

    pub async fn remove_mapping(&self, user_id: i64, email_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM column_assignments WHERE user_id = ? AND email_id = ?")
            .bind(user_id)
            .bind(email_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove column assignment")?;
        Ok(())
    }

    /// Conditional remove: a no-op when the email currently sits in a
    /// different column.
    pub async fn remove_mapping_in(
        &self,
        user_id: i64,
        email_id: &str,
        column_id: &str,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM column_assignments WHERE user_id = ? AND email_id = ? AND column_id = ?",
        )
        .bind(user_id)
        .bind(email_id)
        .bind(column_id)
        .execute(&self.pool)
        .await
        .context("Failed to remove column assignment")?;
        Ok(())
    }

    /// Global scan across all users. Used only by the wake worker.
    pub async fn list_all_snoozed(&self) -> Result<Vec<SnoozedMapping>> {
        let rows = sqlx::query(
            "SELECT user_id, email_id, previous_column_id, snoozed_until
             FROM column_assignments
             WHERE column_id = ? AND snoozed_until IS NOT NULL
             ORDER BY snoozed_until ASC",
        )
        .bind(COLUMN_SNOOZED)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SnoozedMapping {
                user_id: row.get(0),
                email_id: row.get(1),
                previous_column_id: row.get(2),
                snoozed_until: row.get(3),
            })
            .collect())
    }

    // ─── Column definitions ───

    pub async fn upsert_column(&self, column: &ColumnDefinition) -> Result<()> {
        let labels_remove = serde_json::to_string(&column.gmail_labels_remove)
            .context("Failed to serialize label list")?;
        sqlx::query(
            "INSERT INTO columns (user_id, id, name, position, gmail_label_add, gmail_labels_remove)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, id) DO UPDATE SET
                 name = excluded.name, position = excluded.position,
                 gmail_label_add = excluded.gmail_label_add,
                 gmail_labels_remove = excluded.gmail_labels_remove",
        )
        .bind(column.user_id)
        .bind(&column.id)
        .bind(&column.name)
        .bind(column.position)
        .bind(&column.gmail_label_add)
        .bind(labels_remove)
        .execute(&self.pool)
        .await
        .context("Failed to upsert column")?;
        Ok(())
    }

    pub async fn column(&self, user_id: i64, column_id: &str) -> Result<Option<ColumnDefinition>> {
        let row = sqlx::query(
            "SELECT user_id, id, name, position, gmail_label_add, gmail_labels_remove
             FROM columns WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(column_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(map_column))
    }

    pub async fn list_columns(&self, user_id: i64) -> Result<Vec<ColumnDefinition>> {
        let rows = sqlx::query(
            "SELECT user_id, id, name, position, gmail_label_add, gmail_labels_remove
             FROM columns WHERE user_id = ?
             ORDER BY position ASC, id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(map_column).collect())
    }

    /// Deletes a user-defined column. Live assignments pointing at it fall
    /// back to the inbox, and stale previous-column references are cleared so
    /// a later wake cannot restore into the deleted column.
    pub async fn delete_column(&self, user_id: i64, column_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE column_assignments SET column_id = ?, snoozed_until = NULL
             WHERE user_id = ? AND column_id = ?",
        )
        .bind(COLUMN_INBOX)
        .bind(user_id)
        .bind(column_id)
        .execute(&self.pool)
        .await
        .context("Failed to reassign orphaned column assignments")?;

        sqlx::query(
            "UPDATE column_assignments SET previous_column_id = ''
             WHERE user_id = ? AND previous_column_id = ?",
        )
        .bind(user_id)
        .bind(column_id)
        .execute(&self.pool)
        .await?;

        sqlx::query("DELETE FROM columns WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(column_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete column")?;
        Ok(())
    }

    // ─── Reminder store ───

    pub async fn insert_reminder(&self, task: &ReminderTask) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO reminder_tasks (user_id, email_id, title, description, due_at, reminder_at, reminder_sent, priority, status)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task.user_id)
        .bind(&task.email_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(task.due_at)
        .bind(task.reminder_at)
        .bind(task.reminder_sent)
        .bind(&task.priority)
        .bind(&task.status)
        .execute(&self.pool)
        .await
        .context("Failed to insert reminder task")?;
        Ok(result.last_insert_rowid())
    }

    /// Tasks whose reminder is due and has never been attempted.
    pub async fn due_reminders(&self, now: i64) -> Result<Vec<ReminderTask>> {
        let rows = sqlx::query(
            "SELECT id, user_id, email_id, title, description, due_at, reminder_at, reminder_sent, priority, status
             FROM reminder_tasks
             WHERE reminder_at IS NOT NULL AND reminder_at <= ?
               AND reminder_sent = 0 AND status != 'completed'
             ORDER BY reminder_at ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ReminderTask {
                id: row.get(0),
                user_id: row.get(1),
                email_id: row.get(2),
                title: row.get(3),
                description: row.get(4),
                due_at: row.get(5),
                reminder_at: row.get(6),
                reminder_sent: row.get(7),
                priority: row.get(8),
                status: row.get(9),
            })
            .collect())
    }

    pub async fn mark_reminder_sent(&self, task_id: i64) -> Result<()> {
        sqlx::query("UPDATE reminder_tasks SET reminder_sent = 1 WHERE id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark reminder sent")?;
        Ok(())
    }

    pub async fn reminder(&self, task_id: i64) -> Result<Option<ReminderTask>> {
        let row = sqlx::query(
            "SELECT id, user_id, email_id, title, description, due_at, reminder_at, reminder_sent, priority, status
             FROM reminder_tasks WHERE id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ReminderTask {
            id: row.get(0),
            user_id: row.get(1),
            email_id: row.get(2),
            title: row.get(3),
            description: row.get(4),
            due_at: row.get(5),
            reminder_at: row.get(6),
            reminder_sent: row.get(7),
            priority: row.get(8),
            status: row.get(9),
        }))
    }

    // ─── Push tokens ───

    pub async fn add_push_token(
        &self,
        user_id: i64,
        token: &str,
        device_info: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO push_tokens (user_id, token, device_info) VALUES (?, ?, ?)
             ON CONFLICT(user_id, token) DO UPDATE SET device_info = excluded.device_info",
        )
        .bind(user_id)
        .bind(token)
        .bind(device_info)
        .execute(&self.pool)
        .await
        .context("Failed to add push token")?;
        Ok(())
    }

    pub async fn push_tokens(&self, user_id: i64) -> Result<Vec<PushToken>> {
        let rows = sqlx::query(
            "SELECT user_id, token, device_info FROM push_tokens WHERE user_id = ? ORDER BY token ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| PushToken {
                user_id: row.get(0),
                token: row.get(1),
                device_info: row.get(2),
            })
            .collect())
    }

    pub async fn delete_push_tokens(&self, user_id: i64, tokens: &[String]) -> Result<()> {
        for token in tokens {
            sqlx::query("DELETE FROM push_tokens WHERE user_id = ? AND token = ?")
                .bind(user_id)
                .bind(token)
                .execute(&self.pool)
                .await
                .context("Failed to delete push token")?;
        }
        Ok(())
    }
}

fn map_column(row: sqlx::sqlite::SqliteRow) -> ColumnDefinition {
    let labels_remove: String = row.get(5);
    ColumnDefinition {
        user_id: row.get(0),
        id: row.get(1),
        name: row.get(2),
        position: row.get(3),
        gmail_label_add: row.get(4),
        gmail_labels_remove: serde_json::from_str(&labels_remove).unwrap_or_default(),
    }
}
