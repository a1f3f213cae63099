use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

use crate::auth;
use crate::models::MessageSummary;

/// Mailbox operations the engine needs: the latest-message peek used to
/// enrich push notifications, and label edits used to mirror column moves.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    async fn latest_message(&self, user_email: &str) -> Result<Option<MessageSummary>>;

    async fn modify_labels(
        &self,
        user_email: &str,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()>;
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }

    /// Builds an authenticated client, refreshing the stored token once so
    /// credential problems surface here instead of inside a worker loop.
    pub async fn connect(credentials_path: &str) -> Result<Self> {
        let secret = auth::load_secret(credentials_path).await?;
        let authenticator = auth::authenticate(secret).await?;
        authenticator
            .token(auth::SCOPES)
            .await
            .context("Gmail token refresh failed")?;

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .context("Failed to load native TLS roots")?
            .https_only()
            .enable_http1()
            .build();
        let hub = Gmail::new(hyper::Client::builder().build(connector), authenticator);
        Ok(Self::new(hub))
    }
}

#[async_trait]
impl MailboxClient for GmailClient {
    async fn latest_message(&self, user_email: &str) -> Result<Option<MessageSummary>> {
        let (_, message_list) = self
            .hub
            .users()
            .messages_list(user_email)
            .add_label_ids("INBOX")
            .max_results(1)
            .doit()
            .await
            .context("Failed to list messages")?;

        let Some(id) = message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .next()
        else {
            return Ok(None);
        };

        let (_, msg) = self
            .hub
            .users()
            .messages_get(user_email, &id)
            .format("metadata")
            .doit()
            .await
            .context(format!("Failed to get message {}", id))?;

        let mut from = None;
        let mut subject = None;
        if let Some(payload) = &msg.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref() {
                        Some("From") => from = header.value.clone(),
                        Some("Subject") => subject = header.value.clone(),
                        _ => {}
                    }
                }
            }
        }
        let (from_address, from_name) = split_address(from.as_deref());

        Ok(Some(MessageSummary {
            id: msg.id.unwrap_or(id),
            from_address,
            from_name,
            subject,
        }))
    }

    async fn modify_labels(
        &self,
        user_email: &str,
        message_id: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<()> {
        if add.is_empty() && remove.is_empty() {
            return Ok(());
        }

        let req = google_gmail1::api::BatchModifyMessagesRequest {
            ids: Some(vec![message_id.to_string()]),
            add_label_ids: if add.is_empty() { None } else { Some(add.to_vec()) },
            remove_label_ids: if remove.is_empty() { None } else { Some(remove.to_vec()) },
        };
        self.hub
            .users()
            .messages_batch_modify(req, user_email)
            .doit()
            .await
            .context("Failed to modify message labels")?;
        Ok(())
    }
}

/// Splits an RFC 5322 From header into (address, display name).
fn split_address(raw: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(raw) = raw else {
        return (None, None);
    };
    match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            let name = raw[..start].trim().trim_matches('"').trim();
            let address = raw[start + 1..end].trim();
            (
                (!address.is_empty()).then(|| address.to_string()),
                (!name.is_empty()).then(|| name.to_string()),
            )
        }
        _ => {
            let address = raw.trim();
            ((!address.is_empty()).then(|| address.to_string()), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_address_handles_display_names() {
        let (address, name) = split_address(Some("Ada Lovelace <ada@example.com>"));
        assert_eq!(address.as_deref(), Some("ada@example.com"));
        assert_eq!(name.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn split_address_handles_quoted_names() {
        let (address, name) = split_address(Some("\"Lovelace, Ada\" <ada@example.com>"));
        assert_eq!(address.as_deref(), Some("ada@example.com"));
        assert_eq!(name.as_deref(), Some("Lovelace, Ada"));
    }

    #[test]
    fn split_address_handles_bare_addresses() {
        let (address, name) = split_address(Some("ada@example.com"));
        assert_eq!(address.as_deref(), Some("ada@example.com"));
        assert_eq!(name, None);

        assert_eq!(split_address(None), (None, None));
    }
}
