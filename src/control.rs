//! Host-facing lifecycle with statum typestate
//!
//! ```text
//! Disabled ──enable()──► Enabled
//!    ▲                      │
//!    └──────disable()───────┘
//! ```
//!
//! Every `enable()` builds a fresh bus, interpreter and poller worker, so
//! nothing from an earlier run (subscriptions, session context) leaks into
//! the next one.

use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::controller::{DeviceError, PollerError, PollerHandle, PollerSettings, SnapshotSource};
use crate::dispatch::Dispatcher;
use crate::interpreter::{ButtonBindings, CommandInterpreter, ServiceNames};

/// Upper bound on how long `disable()` waits for the poller thread.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(1);

#[state]
#[derive(Debug, Clone)]
pub enum ControlState {
    Disabled, // No worker, no subscriptions
    Enabled,  // Poller running, interpreter subscribed
}

struct ActiveRun {
    bus: Arc<EventBus>,
    interpreter: Arc<CommandInterpreter>,
    poller: PollerHandle,
}

#[machine]
pub struct JoypadControl<S: ControlState> {
    poller_settings: PollerSettings,
    bindings: ButtonBindings,
    services: ServiceNames,
    dispatcher: Arc<dyn Dispatcher>,
    run: Option<ActiveRun>,
}

impl<S: ControlState> JoypadControl<S> {
    pub fn poller_settings(&self) -> &PollerSettings {
        &self.poller_settings
    }
}

impl JoypadControl<Disabled> {
    pub fn create(
        poller_settings: PollerSettings,
        bindings: ButtonBindings,
        services: ServiceNames,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        debug!("Creating joypad control for device {}", poller_settings.device_index);
        Self::new(
            poller_settings,
            bindings,
            services,
            dispatcher,
            None, // run
        )
    }

    /// Builds the pipeline, registers the interpreter and starts the poller.
    ///
    /// `make_source` runs on the poller thread.
    pub fn enable<Src, F>(mut self, make_source: F) -> Result<JoypadControl<Enabled>, PollerError>
    where
        Src: SnapshotSource + 'static,
        F: FnOnce() -> Result<Src, DeviceError> + Send + 'static,
    {
        info!("Enabling joypad control");

        let bus = Arc::new(EventBus::new());
        let interpreter = Arc::new(CommandInterpreter::new(
            self.dispatcher.clone(),
            self.bindings.clone(),
            self.services.clone(),
        ));
        interpreter.register(&bus);

        let poller = match PollerHandle::spawn(self.poller_settings.clone(), bus.clone(), make_source) {
            Ok(poller) => poller,
            Err(e) => {
                error!("Failed to start poller: {}", e);
                bus.clear();
                return Err(e);
            }
        };

        self.run = Some(ActiveRun {
            bus,
            interpreter,
            poller,
        });
        info!("Joypad control enabled");
        Ok(self.transition())
    }
}

impl JoypadControl<Enabled> {
    pub fn bus(&self) -> Option<&Arc<EventBus>> {
        self.run.as_ref().map(|run| &run.bus)
    }

    pub fn interpreter(&self) -> Option<&Arc<CommandInterpreter>> {
        self.run.as_ref().map(|run| &run.interpreter)
    }

    /// False once the worker has exited, e.g. because the source failed to open.
    pub fn is_polling(&self) -> bool {
        self.run.as_ref().is_some_and(|run| !run.poller.is_finished())
    }

    /// Stops the worker and drops every subscription.
    ///
    /// Subscriptions are cleared first, so a delivery already in progress
    /// stops before reaching further handlers. Waits at most
    /// [`STOP_TIMEOUT`] for the worker; a worker wedged in a device read is
    /// detached and can no longer reach any handler.
    pub fn disable(mut self) -> JoypadControl<Disabled> {
        info!("Disabling joypad control");

        if let Some(run) = self.run.take() {
            run.poller.cancel();
            run.bus.clear();
            debug!(
                "Subscriptions cleared ({} state, {} buttons)",
                run.bus.subscriber_count(Topic::StateChanged),
                run.bus.subscriber_count(Topic::ButtonsChanged)
            );
            if !run.poller.join(STOP_TIMEOUT) {
                warn!("Poller worker still busy, left to exit on its own");
            }
        }

        info!("Joypad control disabled");
        self.transition()
    }
}
