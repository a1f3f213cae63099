mod auth;
mod config;
mod db;
mod dispatch;
mod fcm;
mod gmail;
mod models;
mod notifier;
mod reminder;
#[cfg(test)]
mod testutil;
mod wake;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::dispatch::{Dispatcher, PushProvider};
use crate::fcm::FcmClient;
use crate::gmail::{GmailClient, MailboxClient};
use crate::notifier::{ChangeNotifier, NullIndexer};
use crate::reminder::ReminderWorker;
use crate::wake::WakeWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mailboard=info")),
        )
        .init();

    let config = Config::load();

    // The one fatal startup error: without the store nothing below can run.
    let db = Arc::new(db::Database::new(&config.database_url).await?);
    db.run_migrations().await?;

    let call_timeout = Duration::from_secs(config.workers.fetch_timeout_secs);

    let push: Option<Arc<dyn PushProvider>> = match &config.fcm {
        Some(fcm) => Some(Arc::new(FcmClient::new(fcm.server_key.clone(), call_timeout)?)),
        None => {
            warn!("no [fcm] section in settings.toml, push delivery disabled");
            None
        }
    };
    let dispatch = Arc::new(Dispatcher::new(push));

    let mailbox: Option<Arc<dyn MailboxClient>> =
        match GmailClient::connect(&config.gmail.credentials_path).await {
            Ok(client) => Some(Arc::new(client)),
            Err(err) => {
                warn!(error = %err, "gmail client unavailable, label sync and enrichment disabled");
                None
            }
        };

    let cancel = CancellationToken::new();
    let mut workers = Vec::new();

    let wake = WakeWorker::new(
        db.clone(),
        dispatch.clone(),
        mailbox.clone(),
        Duration::from_secs(config.workers.wake_interval_secs),
    );
    workers.push(tokio::spawn(wake.run(cancel.clone())));

    if dispatch.push_enabled() {
        let reminders = ReminderWorker::new(
            db.clone(),
            dispatch.clone(),
            Duration::from_secs(config.workers.reminder_interval_secs),
        );
        workers.push(tokio::spawn(reminders.run(cancel.clone())));
    } else {
        warn!("task reminder worker disabled: no push provider configured");
    }

    // The request layer publishes decoded provider pushes into this channel;
    // it must outlive the workers or the consumer sees a closed source.
    let (event_publisher, event_source) = notifier::channel_source(config.workers.event_buffer);
    let consumer = Arc::new(ChangeNotifier::new(
        db.clone(),
        dispatch.clone(),
        mailbox,
        Arc::new(NullIndexer),
        config.workers.enrichment_concurrency,
        call_timeout,
    ));
    workers.push(tokio::spawn(consumer.run(event_source, cancel.clone())));

    info!("mailboard engine running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    cancel.cancel();
    futures::future::join_all(workers).await;
    drop(event_publisher);

    Ok(())
}
