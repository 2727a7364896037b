//! Remote database uploader
//!
//! Writes records into a Firebase-style Realtime Database over its REST
//! API: one authenticated `PUT {database}/{collection}/{ts}.json` per
//! record. The ID token comes from an email/password sign-in performed at
//! startup and is reused until the database rejects it.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::UploaderConfig;
use crate::types::Measurement;

#[derive(Error, Debug)]
pub enum UploadError {
    /// Transport failure. The request URL is stripped: it carries the
    /// ID token or the API key in its query string.
    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("Remote store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Token rejected by remote store ({0})")]
    Unauthorized(u16),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        UploadError::Http(e.without_url())
    }
}

/// The write side of the remote store, as the forward queue sees it.
#[async_trait]
pub trait RemoteUploader: Send + Sync {
    /// Structured-measurement path.
    async fn upload_measurement(&self, timestamp: i64, measurement: &Measurement) -> Result<(), UploadError>;

    /// Arbitrary JSON path.
    async fn upload_raw(&self, timestamp: i64, data: &Value) -> Result<(), UploadError>;
}

#[derive(Deserialize)]
struct SignInResponse {
    #[serde(rename = "idToken")]
    id_token: Option<String>,
}

pub struct RealtimeDbUploader {
    client: reqwest::Client,
    config: UploaderConfig,
    token: RwLock<Option<String>>,
}

impl RealtimeDbUploader {
    /// Build the client and sign in. A failed sign-in here is fatal to the caller.
    pub async fn connect(config: UploaderConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let uploader = Self {
            client,
            config,
            token: RwLock::new(None),
        };
        let token = uploader.authenticate().await?;
        *uploader.token.write().await = Some(token);
        log::info!("[forward] authenticated with remote store as {}", uploader.config.email);
        Ok(uploader)
    }

    /// URL a record with this timestamp is written to (without credentials).
    pub fn record_url(&self, timestamp: i64) -> String {
        format!(
            "{}/{}/{}.json",
            self.config.database_url.trim_end_matches('/'),
            self.config.collection.trim_matches('/'),
            timestamp
        )
    }

    async fn authenticate(&self) -> Result<String, UploadError> {
        let res = self
            .client
            .post(&self.config.auth_endpoint)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&json!({
                "email": self.config.email,
                "password": self.config.password,
                "returnSecureToken": true,
            }))
            .send()
            .await?;

        let status = res.status();
        if status != StatusCode::OK {
            let body = res.text().await.unwrap_or_default();
            return Err(UploadError::AuthFailed(format!("{}: {}", status, body)));
        }
        let body: SignInResponse = res.json().await?;
        body.id_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| UploadError::AuthFailed("response carried no idToken".to_string()))
    }

    async fn current_token(&self) -> Result<String, UploadError> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }
        log::info!("[forward] re-authenticating with remote store");
        let token = self.authenticate().await?;
        *self.token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn put<T: Serialize + Sync>(&self, timestamp: i64, body: &T) -> Result<(), UploadError> {
        let token = self.current_token().await?;
        let res = self
            .client
            .put(self.record_url(timestamp))
            .query(&[("auth", token.as_str())])
            .json(body)
            .send()
            .await?;

        let status = res.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            *self.token.write().await = None;
            return Err(UploadError::Unauthorized(status.as_u16()));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteUploader for RealtimeDbUploader {
    async fn upload_measurement(&self, timestamp: i64, measurement: &Measurement) -> Result<(), UploadError> {
        self.put(timestamp, &measurement.rounded()).await
    }

    async fn upload_raw(&self, timestamp: i64, data: &Value) -> Result<(), UploadError> {
        self.put(timestamp, data).await
    }
}
