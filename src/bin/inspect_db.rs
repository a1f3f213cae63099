use sqlx::Row;
use sqlx::sqlite::SqlitePoolOptions;
use std::env;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();
    let database_url = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("sqlite://mailboard.db");

    let pool = SqlitePoolOptions::new()
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to database: {}", e))?;

    println!("Snoozed emails:");
    let rows = sqlx::query(
        "SELECT a.user_id, u.email, a.email_id, a.previous_column_id, a.snoozed_until
         FROM column_assignments a
         LEFT JOIN users u ON u.id = a.user_id
         WHERE a.column_id = 'snoozed'
         ORDER BY a.snoozed_until ASC",
    )
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("  (none)");
    }
    for row in rows {
        let user: Option<String> = row.get(1);
        let email_id: String = row.get(2);
        let previous: String = row.get(3);
        let until: Option<i64> = row.get(4);
        println!(
            "  {} {} -> {} (wakes at {})",
            user.unwrap_or_else(|| "?".to_string()),
            email_id,
            if previous.is_empty() { "inbox" } else { &previous },
            until.map(|t| t.to_string()).unwrap_or_else(|| "?".to_string()),
        );
    }

    println!();
    println!("Pending reminders:");
    let rows = sqlx::query(
        "SELECT id, user_id, title, reminder_at, priority, status
         FROM reminder_tasks
         WHERE reminder_sent = 0 AND status != 'completed'
         ORDER BY reminder_at ASC",
    )
    .fetch_all(&pool)
    .await?;

    if rows.is_empty() {
        println!("  (none)");
    }
    for row in rows {
        let id: i64 = row.get(0);
        let user_id: i64 = row.get(1);
        let title: String = row.get(2);
        let reminder_at: Option<i64> = row.get(3);
        let priority: String = row.get(4);
        let status: String = row.get(5);
        println!(
            "  #{} user {} [{}/{}] {} (reminds at {})",
            id,
            user_id,
            priority,
            status,
            title,
            reminder_at
                .map(|t| t.to_string())
                .unwrap_or_else(|| "never".to_string()),
        );
    }

    Ok(())
}
