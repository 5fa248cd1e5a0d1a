//! Handler registration and resolution.
//!
//! This module provides:
//! - `MessageHandler` trait for code that consumes a message body
//! - `HandlerBinding` naming a handler by `(handler, method)` reference
//! - `HandlerRegistry` mapping bindings to handlers, filled at startup

use crate::error::HandlerError;
use crate::message::{Body, HANDLER_CLASS_PROPERTY, HANDLER_METHOD_PROPERTY, Message};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Trait for message handlers.
///
/// Return `Ok(())` when the message is done. Return a recoverable
/// [`HandlerError`] to have the message re-submitted with a longer delay, or
/// a fatal one to drop it.
///
/// # Example
///
/// ```rust,ignore
/// use retry_consumer::{Body, HandlerError, MessageHandler};
///
/// struct UserSync {
///     directory: Arc<DirectoryClient>,
/// }
///
/// #[async_trait]
/// impl MessageHandler for UserSync {
///     async fn handle(&self, body: &Body) -> Result<(), HandlerError> {
///         let uid = body
///             .get("oa_uid")
///             .and_then(|v| v.as_i64())
///             .ok_or_else(|| HandlerError::fatal("missing oa_uid").with_code(10_001))?;
///
///         self.directory
///             .sync(uid)
///             .await
///             .map_err(|e| HandlerError::recoverable(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "user_sync"
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message body.
    async fn handle(&self, body: &Body) -> Result<(), HandlerError>;

    /// Handler name for logging and metrics.
    fn name(&self) -> &'static str;
}

/// Reference pair naming a handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerBinding {
    pub handler_ref: String,
    pub method_ref: String,
}

impl HandlerBinding {
    pub fn new(handler_ref: impl Into<String>, method_ref: impl Into<String>) -> Self {
        Self {
            handler_ref: handler_ref.into(),
            method_ref: method_ref.into(),
        }
    }

    /// Read the binding from message properties, if both halves are present.
    pub fn from_message(message: &Message) -> Option<Self> {
        let handler = message.property_str(HANDLER_CLASS_PROPERTY)?;
        let method = message.property_str(HANDLER_METHOD_PROPERTY)?;
        Some(Self::new(handler, method))
    }

    /// Parse `"handler::method"`.
    pub fn parse(value: &str) -> Option<Self> {
        let (handler, method) = value.split_once("::")?;
        let (handler, method) = (handler.trim(), method.trim());
        (!handler.is_empty() && !method.is_empty()).then(|| Self::new(handler, method))
    }
}

impl fmt::Display for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.handler_ref, self.method_ref)
    }
}

/// Handler chosen for a message.
#[derive(Clone)]
pub struct ResolvedHandler {
    pub binding: HandlerBinding,
    pub handler: Arc<dyn MessageHandler>,
}

/// Registration table of handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerBinding, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `handler_ref::method_ref`.
    pub fn register(
        mut self,
        handler_ref: impl Into<String>,
        method_ref: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let binding = HandlerBinding::new(handler_ref, method_ref);
        debug!(binding = %binding, handler = handler.name(), "Registered message handler");
        self.handlers.insert(binding, handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered bindings, for startup logging.
    pub fn bindings(&self) -> impl Iterator<Item = &HandlerBinding> {
        self.handlers.keys()
    }

    /// Effective binding: the caller override wins over the message properties.
    pub fn binding_for(
        message: &Message,
        override_binding: Option<&HandlerBinding>,
    ) -> Option<HandlerBinding> {
        override_binding
            .cloned()
            .or_else(|| HandlerBinding::from_message(message))
    }

    /// Resolve the handler for a message.
    ///
    /// Returns `None` when no binding is available or the binding is not
    /// registered. Both cases are ordinary outcomes for the caller.
    pub fn resolve(
        &self,
        message: &Message,
        override_binding: Option<&HandlerBinding>,
    ) -> Option<ResolvedHandler> {
        let binding = Self::binding_for(message, override_binding)?;
        let handler = self.handlers.get(&binding)?.clone();
        Some(ResolvedHandler { binding, handler })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Delivery;
    use crate::message::MESSAGE_ID_HEADER;
    use serde_json::json;

    struct Noop(&'static str);

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(&self, _body: &Body) -> Result<(), HandlerError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    fn message(properties: serde_json::Value) -> Message {
        let delivery = Delivery {
            queue: "users".to_string(),
            tag: "1-0".to_string(),
            headers: [(MESSAGE_ID_HEADER.to_string(), "m-1".to_string())].into(),
            properties: properties.as_object().cloned().unwrap_or_default(),
            body: "{}".to_string(),
        };
        Message::from_delivery(&delivery, None, 5).unwrap()
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .register("UserSync", "handle", Arc::new(Noop("user_sync")))
            .register("Audit", "write", Arc::new(Noop("audit")))
    }

    #[test]
    fn test_override_wins() {
        let msg = message(json!({ "handler_class": "UserSync", "handler_method": "handle" }));
        let override_binding = HandlerBinding::new("Audit", "write");

        let resolved = registry().resolve(&msg, Some(&override_binding)).unwrap();
        assert_eq!(resolved.binding, override_binding);
        assert_eq!(resolved.handler.name(), "audit");
    }

    #[test]
    fn test_property_binding() {
        let msg = message(json!({ "handler_class": "UserSync", "handler_method": "handle" }));
        let resolved = registry().resolve(&msg, None).unwrap();
        assert_eq!(resolved.handler.name(), "user_sync");
    }

    #[test]
    fn test_unresolved() {
        assert!(registry().resolve(&message(json!({})), None).is_none());

        let half = message(json!({ "handler_class": "UserSync" }));
        assert!(registry().resolve(&half, None).is_none());

        let unknown = message(json!({ "handler_class": "Billing", "handler_method": "charge" }));
        assert!(registry().resolve(&unknown, None).is_none());
        assert_eq!(
            HandlerRegistry::binding_for(&unknown, None),
            Some(HandlerBinding::new("Billing", "charge"))
        );
    }

    #[test]
    fn test_parse_binding() {
        assert_eq!(
            HandlerBinding::parse("UserSync::handle"),
            Some(HandlerBinding::new("UserSync", "handle"))
        );
        assert_eq!(HandlerBinding::parse("UserSync"), None);
        assert_eq!(HandlerBinding::parse("::handle"), None);
        assert_eq!(HandlerBinding::new("A", "b").to_string(), "A::b");
    }
}
