//! FCM-backed push delivery.
//!
//! Uses the legacy HTTP API: one POST per batch of registration ids, with a
//! per-token result list. Tokens the provider rejects as `NotRegistered` or
//! `InvalidRegistration` are permanently dead and reported back for pruning;
//! every other per-token error is treated as transient and left alone.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::PushProvider;
use crate::models::PushNotification;

const FCM_ENDPOINT: &str = "https://fcm.googleapis.com/fcm/send";

pub struct FcmClient {
    http: reqwest::Client,
    server_key: String,
    endpoint: String,
}

impl FcmClient {
    pub fn new(server_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build FCM HTTP client")?;
        Ok(Self {
            http,
            server_key,
            endpoint: FCM_ENDPOINT.to_string(),
        })
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[derive(Serialize)]
struct FcmRequest<'a> {
    registration_ids: &'a [String],
    notification: FcmNotification<'a>,
    data: &'a serde_json::Value,
}

#[derive(Serialize)]
struct FcmNotification<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct FcmResponse {
    results: Vec<FcmResult>,
}

#[derive(Deserialize)]
struct FcmResult {
    error: Option<String>,
}

#[async_trait]
impl PushProvider for FcmClient {
    async fn send_to_devices(
        &self,
        tokens: &[String],
        notification: &PushNotification,
    ) -> Result<Vec<String>> {
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let request = FcmRequest {
            registration_ids: tokens,
            notification: FcmNotification {
                title: &notification.title,
                body: &notification.body,
            },
            data: &notification.data,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&request)
            .send()
            .await
            .context("FCM request failed")?
            .error_for_status()
            .context("FCM rejected the request")?;

        let body: FcmResponse = response.json().await.context("Invalid FCM response")?;

        // Results come back index-aligned with the request tokens.
        let invalid = body
            .results
            .iter()
            .zip(tokens)
            .filter_map(|(result, token)| match result.error.as_deref() {
                Some("NotRegistered") | Some("InvalidRegistration") => Some(token.clone()),
                _ => None,
            })
            .collect();

        Ok(invalid)
    }
}
