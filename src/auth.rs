//! OAuth token storage and authenticator construction.
//!
//! The refresh token lives in the OS keyring rather than a plaintext file
//! next to the database.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::oauth2;
use keyring::Entry;
use yup_oauth2::storage::{TokenInfo, TokenStorage};
use yup_oauth2::{
    ApplicationSecret, InstalledFlowAuthenticator, InstalledFlowReturnMethod,
    read_application_secret,
};

const SERVICE: &str = "mailboard";
const TOKEN_KEY: &str = "gmail_token";

/// Label sync and latest-message peeks both need modify access.
pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.modify"];

pub type GmailAuthenticator = oauth2::authenticator::Authenticator<
    hyper_rustls::HttpsConnector<hyper::client::HttpConnector>,
>;

/// Token storage backed by the OS keyring.
pub struct KeyringTokens;

impl KeyringTokens {
    fn entry() -> Result<Entry> {
        Entry::new(SERVICE, TOKEN_KEY).map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }
}

#[async_trait]
impl TokenStorage for KeyringTokens {
    async fn set(&self, _scopes: &[&str], token: TokenInfo) -> Result<()> {
        let serialized = serde_json::to_string(&token).context("Failed to serialize token")?;
        Self::entry()?
            .set_password(&serialized)
            .map_err(|e| anyhow::anyhow!("Keyring error: {}", e))
    }

    async fn get(&self, _scopes: &[&str]) -> Option<TokenInfo> {
        let entry = Self::entry().ok()?;
        match entry.get_password() {
            Ok(serialized) => serde_json::from_str(&serialized).ok(),
            Err(_) => None,
        }
    }
}

pub async fn load_secret<P: AsRef<Path>>(path: P) -> Result<ApplicationSecret> {
    read_application_secret(path)
        .await
        .context("Failed to read application secret")
}

/// Builds the installed-flow authenticator over the keyring storage. First
/// use walks the user through the browser consent flow; after that the
/// stored refresh token is enough.
pub async fn authenticate(secret: ApplicationSecret) -> Result<GmailAuthenticator> {
    InstalledFlowAuthenticator::builder(secret, InstalledFlowReturnMethod::HTTPRedirect)
        .with_storage(Box::new(KeyringTokens))
        .build()
        .await
        .context("Failed to build authenticator")
}
