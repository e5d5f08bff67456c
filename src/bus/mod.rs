//! Named-topic publish/subscribe between the poller and its consumers.
//!
//! Delivery is synchronous: [`EventBus::publish`] invokes every current
//! subscriber of the topic, in registration order, before returning. A
//! subscriber that returns an error or panics is logged and skipped; the
//! remaining subscribers still run and nothing propagates back to the
//! publisher.
//!
//! ```text
//! SettleDetector ──► ChangeRecord ──► state-changed ──────► handlers
//!                         │
//!                         └─► ButtonDelta? ─► buttons-changed ─► handlers
//! ```

use color_eyre::Result;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::controller::diff::{ButtonDelta, ChangeRecord};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    StateChanged,
    ButtonsChanged,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::StateChanged => write!(f, "state-changed"),
            Topic::ButtonsChanged => write!(f, "buttons-changed"),
        }
    }
}

#[derive(Clone, Debug)]
pub enum BusEvent {
    StateChanged(Arc<ChangeRecord>),
    ButtonsChanged {
        record: Arc<ChangeRecord>,
        buttons: ButtonDelta,
    },
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::StateChanged(_) => Topic::StateChanged,
            BusEvent::ButtonsChanged { .. } => Topic::ButtonsChanged,
        }
    }

    pub fn record(&self) -> &ChangeRecord {
        match self {
            BusEvent::StateChanged(record) => record,
            BusEvent::ButtonsChanged { record, .. } => record,
        }
    }
}

pub type Handler = Arc<dyn Fn(&BusEvent) -> Result<()> + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    name: String,
    handler: Handler,
}

// Outcome of a single publish
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<HashMap<Topic, Vec<Subscription>>>,
    // bumped by `clear` so an in-flight publish stops calling dropped handlers
    generation: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers `handler` on `topic`. The bus keeps a strong reference until
    /// [`EventBus::clear`].
    pub fn subscribe<F>(&self, topic: Topic, name: impl Into<String>, handler: F)
    where
        F: Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Subscribing {} to {}", name, topic);
        self.lock().entry(topic).or_default().push(Subscription {
            name,
            handler: Arc::new(handler),
        });
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.lock().get(&topic).map_or(0, Vec::len)
    }

    /// Drops every subscription on every topic.
    pub fn clear(&self) {
        let mut subscriptions = self.lock();
        self.generation.fetch_add(1, Ordering::SeqCst);
        let dropped: usize = subscriptions.values().map(Vec::len).sum();
        subscriptions.clear();
        info!("Cleared {} event bus subscriptions", dropped);
    }

    pub fn publish(&self, event: &BusEvent) -> Delivery {
        let topic = event.topic();
        let (generation, subscribers) = {
            let subscriptions = self.lock();
            (
                self.generation.load(Ordering::SeqCst),
                subscriptions.get(&topic).cloned().unwrap_or_default(),
            )
        };

        let mut delivery = Delivery::default();
        for subscription in &subscribers {
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!("Subscriptions cleared during {} delivery, stopping", topic);
                break;
            }

            match catch_unwind(AssertUnwindSafe(|| (subscription.handler)(event))) {
                Ok(Ok(())) => {
                    trace!("{} handled {}", subscription.name, topic);
                    delivery.delivered += 1;
                }
                Ok(Err(e)) => {
                    error!(
                        "Handler {} failed on {} ({}): {:?}",
                        subscription.name,
                        topic,
                        event.record().diff,
                        e
                    );
                    delivery.failed += 1;
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(
                        "Handler {} panicked on {} ({}): {}",
                        subscription.name,
                        topic,
                        event.record().diff,
                        reason
                    );
                    delivery.failed += 1;
                }
            }
        }
        delivery
    }

    /// Publishes one accepted transition: `state-changed` always, then
    /// `buttons-changed` if at least one button flipped.
    pub fn publish_transition(&self, record: ChangeRecord) -> Option<ButtonDelta> {
        let buttons = record.button_delta();
        let record = Arc::new(record);

        self.publish(&BusEvent::StateChanged(record.clone()));
        if let Some(buttons) = &buttons {
            self.publish(&BusEvent::ButtonsChanged {
                record,
                buttons: buttons.clone(),
            });
        }
        buttons
    }
}
