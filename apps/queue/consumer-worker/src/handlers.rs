//! Handlers shipped with the worker.
//!
//! `Log::handle` acknowledges anything it is given; `UserSync::handle`
//! forwards a user id to a downstream sync endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use retry_consumer::{Body, HandlerError, MessageHandler};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Business code for a message without a usable `oa_uid`.
pub const MISSING_UID_CODE: i64 = 10001;

/// Business code for a user the sync endpoint does not know.
pub const UNKNOWN_USER_CODE: i64 = 10002;

/// Logs the body and succeeds.
pub struct LogHandler;

#[async_trait]
impl MessageHandler for LogHandler {
    async fn handle(&self, body: &Body) -> Result<(), HandlerError> {
        info!(fields = body.len(), body = ?body, "Message received");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Posts `{"oa_uid": ..}` to a user sync endpoint.
///
/// Transport failures and 5xx answers are worth retrying. A 404 or any other
/// 4xx means the message itself is wrong, so those are fatal.
pub struct UserSyncHandler {
    client: reqwest::Client,
    url: String,
}

impl UserSyncHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl MessageHandler for UserSyncHandler {
    async fn handle(&self, body: &Body) -> Result<(), HandlerError> {
        let uid = body
            .get("oa_uid")
            .and_then(|v| v.as_i64().or_else(|| v.as_str()?.parse().ok()))
            .ok_or_else(|| {
                HandlerError::fatal("message has no numeric oa_uid").with_code(MISSING_UID_CODE)
            })?;

        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "oa_uid": uid }))
            .send()
            .await
            .map_err(|e| HandlerError::recoverable(format!("user sync unreachable: {}", e)))?;

        match response.status() {
            status if status.is_success() => {
                debug!(oa_uid = uid, "User synced");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(HandlerError::fatal(format!("unknown user {}", uid))
                .with_code(UNKNOWN_USER_CODE)),
            status if status.is_client_error() => Err(HandlerError::fatal(format!(
                "user sync refused {}: {}",
                uid, status
            ))
            .with_code(i64::from(status.as_u16()))),
            status => Err(HandlerError::recoverable(format!(
                "user sync failed for {}: {}",
                uid, status
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "user_sync"
    }
}
