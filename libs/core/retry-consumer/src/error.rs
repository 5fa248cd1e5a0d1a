//! Consumer error types and error classification
//!
//! Every failure the consumer can observe falls into one of four kinds, and
//! the engine switches on the kind rather than on the concrete variant:
//! - **Structural**: missing message id or unparseable body, never retried
//! - **Infrastructure**: Redis, broker or HTTP transport failures, retried
//! - **RecoverableHandler**: handler failed, re-submitted with a longer delay
//! - **FatalHandler**: handler gave up, the message is terminal

use thiserror::Error;

/// Closed classification of consumer failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The message itself is unusable (no id, malformed body).
    Structural,
    /// A collaborator (store, broker, HTTP service) could not be reached.
    Infrastructure,
    /// The handler failed but the message may succeed later.
    RecoverableHandler,
    /// The handler failed and the message must not be retried.
    FatalHandler,
}

/// Error returned by a [`MessageHandler`](crate::MessageHandler).
///
/// Handlers fail recoverably by default. Use [`HandlerError::fatal`] to end
/// processing immediately, optionally tagged with a numeric error code that
/// monitoring uses to tell business rejections from real defects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render(.code, .message))]
pub struct HandlerError {
    message: String,
    code: Option<i64>,
    fatal: bool,
}

impl HandlerError {
    /// Create a recoverable handler error.
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            fatal: false,
        }
    }

    /// Create a fatal handler error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            fatal: true,
        }
    }

    /// Attach an error code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    pub fn kind(&self) -> ErrorKind {
        if self.fatal {
            ErrorKind::FatalHandler
        } else {
            ErrorKind::RecoverableHandler
        }
    }
}

fn render(code: &Option<i64>, message: &str) -> String {
    match code {
        Some(code) => format!("[{}] {}", code, message),
        None => message.to_string(),
    }
}

/// Consumer errors
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Message carries no usable identifier
    #[error("Message has no identifier")]
    MissingMessageId,

    /// Message body could not be decoded
    #[error("Malformed message body: {0}")]
    MalformedBody(String),

    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP transport error talking to the queue or log service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote service answered but refused the request
    #[error("Remote service rejected request (code {code}): {message}")]
    RemoteRejected { code: i64, message: String },

    /// Broker-level failure (fetch, ack, reject)
    #[error("Broker error: {0}")]
    Broker(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Handler failure
    #[error("Handler error: {0}")]
    Handler(HandlerError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConsumerError {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsumerError::MissingMessageId => ErrorKind::Structural,
            ConsumerError::MalformedBody(_) => ErrorKind::Structural,
            ConsumerError::Redis(_) => ErrorKind::Infrastructure,
            ConsumerError::Http(_) => ErrorKind::Infrastructure,
            ConsumerError::RemoteRejected { .. } => ErrorKind::Infrastructure,
            ConsumerError::Broker(_) => ErrorKind::Infrastructure,
            ConsumerError::Serialization(_) => ErrorKind::Structural,
            ConsumerError::Handler(e) => e.kind(),
            ConsumerError::Config(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether this error came from the broker itself (fetch/ack/reject).
    pub fn is_broker_error(&self) -> bool {
        matches!(self, ConsumerError::Broker(_))
    }

    /// Whether this looks like a lost connection rather than a command error.
    pub fn is_connection_error(&self) -> bool {
        match self {
            ConsumerError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error()
            }
            ConsumerError::Http(e) => e.is_connect() || e.is_timeout(),
            ConsumerError::Broker(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ConsumerError {
    fn from(err: serde_json::Error) -> Self {
        ConsumerError::Serialization(err.to_string())
    }
}

impl From<HandlerError> for ConsumerError {
    fn from(err: HandlerError) -> Self {
        ConsumerError::Handler(err)
    }
}

pub type ConsumerResult<T> = Result<T, ConsumerError>;
