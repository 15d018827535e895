use herald_rabbitmq::{DecodeError, EncodeError, Publishable, from_json, to_json};
use serde::{Deserialize, Serialize};

pub const TEST_EVENT: &str = "test-event";
pub const FAILING_EVENT: &str = "failing-event";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestEvent {
    pub message: String,
}

impl TestEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Publishable for TestEvent {
    fn kind(&self) -> &str {
        TEST_EVENT
    }

    fn routing_key(&self) -> &str {
        "test.event"
    }

    fn marshal(&self) -> Result<Vec<u8>, EncodeError> {
        to_json(self)
    }

    fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError> {
        from_json(bytes)
    }
}

/// Same body as [`TestEvent`], under a type whose handler always fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailingEvent {
    pub message: String,
}

impl Publishable for FailingEvent {
    fn kind(&self) -> &str {
        FAILING_EVENT
    }

    fn routing_key(&self) -> &str {
        "test.failing"
    }

    fn marshal(&self) -> Result<Vec<u8>, EncodeError> {
        to_json(self)
    }

    fn unmarshal(bytes: &[u8]) -> Result<Self, DecodeError> {
        from_json(bytes)
    }
}
