//! Shared HTTP client for the queue and log services
//!
//! Every request body is wrapped in an [`Envelope`] that adds the caller id
//! and a per-request uuid. The error channel (`/queue/error`) is the last
//! resort: when it fails too, the failure is only logged.

use crate::config::ApiConfig;
use crate::error::ConsumerError;
use crate::metrics;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Path of the error report endpoint.
pub const ERROR_PATH: &str = "/queue/error";

/// Request body plus the caller identification every service expects.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    #[serde(flatten)]
    pub payload: T,
    pub callerid: String,
    pub uuid: String,
}

/// HTTP client bound to one [`ApiConfig`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    config: Arc<ApiConfig>,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Result<Self, ConsumerError> {
        let http = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// Fresh request id: caller id followed by a simple-form UUIDv4.
    pub fn request_uuid(&self) -> String {
        format!("{}{}", self.config.callerid, Uuid::new_v4().simple())
    }

    /// Wrap a payload with caller id and a fresh uuid.
    pub fn envelope<T: Serialize>(&self, payload: T) -> Envelope<T> {
        Envelope {
            payload,
            callerid: self.config.callerid.clone(),
            uuid: self.request_uuid(),
        }
    }

    /// Join a base URL and a path without doubling slashes.
    pub fn url(base: &str, path: &str) -> String {
        format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// POST a JSON body.
    ///
    /// Transport failures come back as [`ConsumerError::Http`]; a non-2xx
    /// answer as [`ConsumerError::RemoteRejected`] with the HTTP status as
    /// code.
    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<reqwest::Response, ConsumerError> {
        let response = self.http.post(url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsumerError::RemoteRejected {
                code: i64::from(status.as_u16()),
                message: format!("{} answered {}", url, status),
            });
        }

        Ok(response)
    }

    /// Send an error report to `/queue/error`.
    ///
    /// Never fails: if the error channel itself is unreachable the report is
    /// written to the local log instead.
    pub async fn report_error(&self, params: Value, error_msg: &str, origin: &str) {
        let url = Self::url(&self.config.log_error_api, ERROR_PATH);
        let report = self.envelope(json!({
            "params": params,
            "error_msg": error_msg,
        }));

        match self.post_json(&url, &report).await {
            Ok(_) => debug!(origin = %origin, "Sent error report"),
            Err(e) => {
                metrics::report_failed("error");
                error!(
                    origin = %origin,
                    url = %url,
                    error = %e,
                    error_msg = %error_msg,
                    params = %report.payload["params"],
                    "Queue error service unreachable"
                );
            }
        }
    }
}
