//! Outbound requests to named remote services.
//!
//! Dispatch is fire-and-forget: [`Dispatcher::dispatch`] returns nothing and
//! there is no delivery guarantee. A caller that needs the response passes a
//! [`ReplyCallback`]; it runs later on whatever thread the transport chooses,
//! or never if the request or its response is lost.

pub mod log;
pub mod mqtt;

use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

pub use self::log::LogDispatcher;
pub use self::mqtt::{MqttDispatcher, MqttSettings};

/// Invoked at most once with the decoded response payload.
pub type ReplyCallback = Box<dyn FnOnce(Value) + Send + 'static>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceCall {
    pub service: String,
    pub command: String,
    pub args: Map<String, Value>,
}

impl ServiceCall {
    pub fn new(service: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            command: command.into(),
            args: Map::new(),
        }
    }

    pub fn arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }
}

impl fmt::Display for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.service, self.command)?;
        if !self.args.is_empty() {
            write!(f, " {}", Value::Object(self.args.clone()))?;
        }
        Ok(())
    }
}

// Dispatch errors; only ever logged, never returned to the interpreter
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Failed to encode request: {0}")]
    EncodeError(#[from] serde_json::Error),

    #[error("Failed to publish request: {0}")]
    PublishError(String),

    #[error("Failed to decode reply on {topic}: {reason}")]
    ReplyError { topic: String, reason: String },

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, call: ServiceCall, on_result: Option<ReplyCallback>);
}
