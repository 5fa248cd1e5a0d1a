//! Message submission through the remote produce service
//!
//! `produce` creates a new message; `re_produce` puts an existing message
//! back under its original id with a delay, which is how retries are
//! scheduled.

use crate::client::ApiClient;
use crate::config::DEFAULT_ATTEMPT_LIMIT;
use crate::error::ConsumerError;
use crate::registry::HandlerBinding;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Path of the submission endpoint.
pub const PRODUCE_PATH: &str = "/queue/produce";

/// Path of the re-submission endpoint.
pub const RE_PRODUCE_PATH: &str = "/queue/reProduce";

/// A message to submit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProduceRequest {
    pub queue_name: String,
    pub message: Value,
    /// Delay before the message becomes visible, in milliseconds
    pub delay: u64,
    pub max_retry_times: u32,
    pub handler_class: String,
    pub handler_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl ProduceRequest {
    pub fn new(queue_name: impl Into<String>, message: Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            message,
            delay: 0,
            max_retry_times: DEFAULT_ATTEMPT_LIMIT,
            handler_class: String::new(),
            handler_method: String::new(),
            message_id: None,
        }
    }

    pub fn with_binding(mut self, binding: &HandlerBinding) -> Self {
        self.handler_class = binding.handler_ref.clone();
        self.handler_method = binding.method_ref.clone();
        self
    }

    pub fn with_attempt_limit(mut self, limit: u32) -> Self {
        self.max_retry_times = limit;
        self
    }

    pub fn with_delay_ms(mut self, delay: u64) -> Self {
        self.delay = delay;
        self
    }
}

/// Answer of the produce service.
#[derive(Debug, Clone, Deserialize)]
pub struct ProduceResponse {
    pub code: i64,
    #[serde(default)]
    pub data: Option<ProduceData>,
    #[serde(default)]
    pub msg: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProduceData {
    #[serde(default)]
    pub message_id: Option<String>,
}

impl ProduceResponse {
    /// The assigned message id, or the reason there is none.
    pub fn into_message_id(self) -> Result<String, ConsumerError> {
        if self.code != 0 {
            return Err(ConsumerError::RemoteRejected {
                code: self.code,
                message: self.msg,
            });
        }

        self.data
            .and_then(|d| d.message_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ConsumerError::RemoteRejected {
                code: self.code,
                message: "response carries no message_id".to_string(),
            })
    }
}

/// Submits messages to the queue.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProducerGateway: Send + Sync {
    /// Submit a new message, returning its id.
    async fn produce(&self, request: &ProduceRequest) -> Result<String, ConsumerError>;

    /// Re-submit an existing message under its original id.
    async fn re_produce(
        &self,
        original_message_id: &str,
        request: &ProduceRequest,
    ) -> Result<String, ConsumerError>;
}

/// Producer over the HTTP produce service.
#[derive(Clone)]
pub struct HttpProducerGateway {
    client: ApiClient,
}

impl HttpProducerGateway {
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// POST once, retry once on transport failure, then report and give up.
    ///
    /// A remote refusal is an answer, not a transport failure, so it is
    /// returned without retrying.
    async fn submit(
        &self,
        path: &str,
        request: &ProduceRequest,
        origin: &str,
    ) -> Result<String, ConsumerError> {
        let url = ApiClient::url(&self.client.config().queue_api, path);
        let payload = self.client.envelope(request);

        let response = match self.client.post_json(&url, &payload).await {
            Ok(response) => response,
            Err(ConsumerError::Http(first)) => {
                warn!(url = %url, error = %first, "Produce request failed, retrying once");
                match self.client.post_json(&url, &payload).await {
                    Ok(response) => response,
                    Err(e) => {
                        self.client
                            .report_error(serde_json::to_value(&payload)?, &e.to_string(), origin)
                            .await;
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        let message_id = response.json::<ProduceResponse>().await?.into_message_id()?;
        debug!(queue = %request.queue_name, message_id = %message_id, delay_ms = request.delay, "Submitted message");
        Ok(message_id)
    }
}

#[async_trait]
impl ProducerGateway for HttpProducerGateway {
    async fn produce(&self, request: &ProduceRequest) -> Result<String, ConsumerError> {
        self.submit(PRODUCE_PATH, request, "produce").await
    }

    async fn re_produce(
        &self,
        original_message_id: &str,
        request: &ProduceRequest,
    ) -> Result<String, ConsumerError> {
        let mut request = request.clone();
        request.message_id = Some(original_message_id.to_string());
        self.submit(RE_PRODUCE_PATH, &request, "re_produce").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiConfig;
    use crate::test_support::{FakeQueueApi, unreachable_url};
    use serde_json::json;

    fn gateway(base: &str) -> HttpProducerGateway {
        let config = ApiConfig::new(base).with_callerid("billing");
        HttpProducerGateway::new(ApiClient::new(config).unwrap())
    }

    #[tokio::test]
    async fn test_produce_posts_request() {
        let api = FakeQueueApi::start().await;

        let request = ProduceRequest::new("orders", json!({ "oa_uid": 7747 }))
            .with_binding(&HandlerBinding::new("UserSync", "handle"));
        let id = gateway(&api.base_url()).produce(&request).await.unwrap();
        assert_eq!(id, "srv-1");

        let calls = api.calls_to(PRODUCE_PATH);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["queue_name"], "orders");
        assert_eq!(calls[0]["message"]["oa_uid"], 7747);
        assert_eq!(calls[0]["delay"], 0);
        assert_eq!(calls[0]["max_retry_times"], 5);
        assert_eq!(calls[0]["handler_class"], "UserSync");
        assert_eq!(calls[0]["callerid"], "billing");
        assert!(calls[0].get("message_id").is_none());
    }

    #[tokio::test]
    async fn test_re_produce_keeps_original_id() {
        let api = FakeQueueApi::start().await;

        let request = ProduceRequest::new("orders", json!({})).with_delay_ms(600_000);
        gateway(&api.base_url()).re_produce("m-42", &request).await.unwrap();

        let calls = api.calls_to(RE_PRODUCE_PATH);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["message_id"], "m-42");
        assert_eq!(calls[0]["delay"], 600_000);
    }

    #[tokio::test]
    async fn test_remote_refusal_is_not_retried() {
        let api = FakeQueueApi::start().await;
        api.refuse_produce(40_001, "queue unknown");

        let err = gateway(&api.base_url())
            .produce(&ProduceRequest::new("nope", json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::RemoteRejected { code: 40_001, .. }));
        assert_eq!(api.calls_to(PRODUCE_PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_submission_is_retried_once() {
        let api = FakeQueueApi::start().await;
        api.stall(PRODUCE_PATH, 1);
        let config = ApiConfig::new(api.base_url()).with_timeout_secs(1);
        let gateway = HttpProducerGateway::new(ApiClient::new(config).unwrap());

        let id = gateway
            .produce(&ProduceRequest::new("orders", json!({ "a": 1 })))
            .await
            .unwrap();

        assert_eq!(id, "srv-1");
        let calls = api.calls_to(PRODUCE_PATH);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], calls[1]);
        assert!(api.calls_to(crate::client::ERROR_PATH).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_reports_error() {
        let api = FakeQueueApi::start().await;
        let config = ApiConfig::new(unreachable_url().await)
            .with_log_error_api(api.base_url())
            .with_timeout_secs(1);
        let gateway = HttpProducerGateway::new(ApiClient::new(config).unwrap());

        let err = gateway
            .produce(&ProduceRequest::new("orders", json!({ "a": 1 })))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Http(_)));

        let reports = api.calls_to(crate::client::ERROR_PATH);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0]["params"]["queue_name"], "orders");
        assert!(!reports[0]["error_msg"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_response_without_id_is_rejected() {
        let response: ProduceResponse =
            serde_json::from_value(json!({ "code": 0, "data": {}, "msg": "" })).unwrap();
        assert!(response.into_message_id().is_err());
    }
}
