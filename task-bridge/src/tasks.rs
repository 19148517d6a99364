//! Built-in task types.

use async_trait::async_trait;
use tracing::info;

use crate::queue::Envelope;
use crate::registry::{Delivery, FallbackPolicy, Outcome, RegistryError, TaskHandler, TaskRegistry};

/// Type tag of the smoke-test message published by the HTTP route.
pub const TEST_MESSAGE: &str = "test_message";

/// Text sent by the HTTP test route.
pub const TEST_MESSAGE_TEXT: &str = "Test message text";

/// Build a `test_message` envelope carrying `text`.
pub fn test_message(text: impl Into<String>) -> Envelope {
    Envelope::new(TEST_MESSAGE).with_field("message", text.into())
}

/// Logs the `message` field of a `test_message`.
pub struct TestMessageHandler;

#[async_trait]
impl TaskHandler for TestMessageHandler {
    async fn handle(&self, delivery: Delivery) -> Outcome {
        let text = delivery.envelope.get_str("message").unwrap_or_default();
        info!(
            task_type = TEST_MESSAGE,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Test task message: {}",
            text
        );
        Outcome::Processed
    }
}

/// Registry with every built-in handler and the given fallback policy.
pub fn default_registry(fallback: FallbackPolicy) -> Result<TaskRegistry, RegistryError> {
    TaskRegistry::builder()
        .handler(TEST_MESSAGE, TestMessageHandler)
        .fallback_policy(fallback)
        .build()
}
