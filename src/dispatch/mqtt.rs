//! MQTT transport for service calls.
//!
//! A call to `service::command` is published as JSON on
//! `<prefix>/<service>/<command>`:
//!
//! ```text
//! {"command": "...", "args": {...}, "reply_to": "<prefix>/replies/<client_id>/<id>"}
//! ```
//!
//! `reply_to` is only present when the caller wants the result. The service
//! answers by publishing a JSON payload on that topic; the event loop task
//! routes it to the pending callback and forgets the request. A newer request
//! on the same topic supersedes one that is still unanswered.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{DispatchError, Dispatcher, ReplyCallback, ServiceCall};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "joypad-control".to_string(),
            topic_prefix: "microdrop".to_string(),
            keep_alive_secs: 5,
            user: None,
            password: None,
        }
    }
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    command: &'a str,
    args: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

struct PendingReply {
    route: String,
    callback: ReplyCallback,
}

/// Callbacks waiting for a reply, keyed by request id.
///
/// At most one request per route (`<prefix>/<service>/<command>`) is kept:
/// registering a newer one drops the older callback, so lookups that are
/// never answered cannot pile up.
#[derive(Default)]
struct ReplyTable {
    entries: Mutex<HashMap<u64, PendingReply>>,
}

impl ReplyTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, PendingReply>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns how many earlier requests on the same route were superseded.
    fn register(&self, request_id: u64, route: String, callback: ReplyCallback) -> usize {
        let superseded: Vec<PendingReply> = {
            let mut entries = self.lock();
            let stale: Vec<u64> = entries
                .iter()
                .filter(|(_, pending)| pending.route == route)
                .map(|(id, _)| *id)
                .collect();
            let superseded = stale.iter().filter_map(|id| entries.remove(id)).collect();
            entries.insert(request_id, PendingReply { route, callback });
            superseded
        };
        // callbacks are dropped outside the lock
        superseded.len()
    }

    fn take(&self, request_id: u64) -> Option<ReplyCallback> {
        self.lock().remove(&request_id).map(|pending| pending.callback)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

type PendingReplies = Arc<ReplyTable>;

pub struct MqttDispatcher {
    client: AsyncClient,
    settings: MqttSettings,
    pending: PendingReplies,
    next_request: AtomicU64,
    state: Arc<Mutex<ConnectionState>>,
}

impl MqttDispatcher {
    /// Creates the client and spawns its event loop on the current tokio
    /// runtime. The loop runs until `cancel` fires.
    pub fn spawn(settings: MqttSettings, cancel: CancellationToken) -> (Arc<Self>, JoinHandle<()>) {
        info!(
            "Connecting MQTT dispatcher to {}:{} as {}",
            settings.host, settings.port, settings.client_id
        );
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(1)));
        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            options.set_credentials(user.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let dispatcher = Arc::new(Self {
            client: client.clone(),
            settings: settings.clone(),
            pending: Arc::new(ReplyTable::default()),
            next_request: AtomicU64::new(1),
            state: Arc::new(Mutex::new(ConnectionState::Connecting)),
        });

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client,
            settings,
            dispatcher.pending.clone(),
            dispatcher.state.clone(),
            cancel,
        ));

        (dispatcher, task)
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn request_topic(&self, call: &ServiceCall) -> String {
        format!(
            "{}/{}/{}",
            self.settings.topic_prefix, call.service, call.command
        )
    }

    fn try_dispatch(
        &self,
        call: &ServiceCall,
        on_result: Option<ReplyCallback>,
    ) -> Result<(), DispatchError> {
        let request_id = on_result.map(|callback| {
            let id = self.next_request.fetch_add(1, Ordering::Relaxed);
            let superseded = self
                .pending
                .register(id, self.request_topic(call), callback);
            if superseded > 0 {
                debug!("Request {} supersedes {} unanswered {}", id, superseded, call.command);
            }
            id
        });
        let envelope = RequestEnvelope {
            command: &call.command,
            args: &call.args,
            reply_to: request_id.map(|id| reply_topic(&self.settings, id)),
        };

        let published = serde_json::to_vec(&envelope)
            .map_err(DispatchError::from)
            .and_then(|payload| {
                self.client
                    .try_publish(self.request_topic(call), QoS::AtLeastOnce, false, payload)
                    .map_err(|e| DispatchError::PublishError(e.to_string()))
            });

        if published.is_err() {
            if let Some(id) = request_id {
                drop(self.pending.take(id));
            }
        }
        published
    }
}

impl Dispatcher for MqttDispatcher {
    fn dispatch(&self, call: ServiceCall, on_result: Option<ReplyCallback>) {
        match self.try_dispatch(&call, on_result) {
            Ok(()) => debug!("Published {}", call),
            Err(e) => warn!("Dropped {}: {}", call, e),
        }
    }
}

fn reply_topic(settings: &MqttSettings, request_id: u64) -> String {
    format!(
        "{}/replies/{}/{}",
        settings.topic_prefix, settings.client_id, request_id
    )
}

fn reply_filter(settings: &MqttSettings) -> String {
    format!("{}/replies/{}/+", settings.topic_prefix, settings.client_id)
}

fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
    let mut current = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if *current != next {
        info!("MQTT connection state: {:?} -> {:?}", *current, next);
        *current = next;
    }
}

/// Hands a reply payload to the callback waiting on `topic`.
///
/// Returns `Ok(false)` for replies nobody is waiting for (already answered,
/// superseded, or sent to a previous process with the same client id).
fn route_reply(
    pending: &ReplyTable,
    topic: &str,
    payload: &[u8],
) -> Result<bool, DispatchError> {
    let request_id: u64 = topic
        .rsplit('/')
        .next()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| DispatchError::ReplyError {
            topic: topic.to_string(),
            reason: "no request id in topic".to_string(),
        })?;

    let Some(callback) = pending.take(request_id) else {
        return Ok(false);
    };

    let value: Value = serde_json::from_slice(payload).map_err(|e| DispatchError::ReplyError {
        topic: topic.to_string(),
        reason: e.to_string(),
    })?;
    callback(value);
    Ok(true)
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    settings: MqttSettings,
    pending: PendingReplies,
    state: Arc<Mutex<ConnectionState>>,
    cancel: CancellationToken,
) {
    info!("MQTT event loop started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                set_state(&state, ConnectionState::Connected);
                // clean sessions forget subscriptions, so resubscribe on every connect
                if let Err(e) = client.try_subscribe(reply_filter(&settings), QoS::AtLeastOnce) {
                    error!("Failed to subscribe to replies: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                match route_reply(&pending, &publish.topic, &publish.payload) {
                    Ok(true) => debug!("Routed reply on {}", publish.topic),
                    Ok(false) => debug!(
                        "No pending request for {} ({} waiting)",
                        publish.topic,
                        pending.len()
                    ),
                    Err(e) => warn!("{}", e),
                }
            }
            Ok(other) => trace!("MQTT event: {:?}", other),
            Err(e) => {
                let e = DispatchError::ConnectionError(e.to_string());
                warn!("{}, retrying in {:?}", e, RECONNECT_DELAY);
                set_state(&state, ConnectionState::Reconnecting);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    set_state(&state, ConnectionState::Disconnected);
    info!("MQTT event loop stopped");
}
