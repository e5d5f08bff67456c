use gilrs::{Axis, Button, GamepadId, Gilrs};
use tracing::{error, info, trace, warn};

use super::snapshot::{normalize_axis, Axes, Snapshot};

// Device errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Joypad {0} not plugged in")]
    NotConnected(usize),

    #[error("Failed to read joypad state: {0}")]
    ReadError(String),

    #[error("Failed to initialize input backend: {0}")]
    InitializationError(String),
}

impl DeviceError {
    /// Transient errors are retried silently by the poller.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::NotConnected(_) | DeviceError::ReadError(_))
    }
}

/// Yields one immutable [`Snapshot`] per call for the addressed device.
///
/// Implementations are owned by the poller worker and are called at
/// sub-millisecond cadence, so `read` must not block on the device.
pub trait SnapshotSource {
    fn read(&mut self, device_index: usize) -> Result<Snapshot, DeviceError>;
}

// Fixed report order; index N in `button_states` is always BUTTON_ORDER[N].
pub const BUTTON_ORDER: [Button; 17] = [
    Button::South,
    Button::East,
    Button::West,
    Button::North,
    Button::LeftTrigger,
    Button::RightTrigger,
    Button::Select,
    Button::Start,
    Button::LeftThumb,
    Button::RightThumb,
    Button::LeftTrigger2,
    Button::RightTrigger2,
    Button::Mode,
    Button::DPadUp,
    Button::DPadDown,
    Button::DPadLeft,
    Button::DPadRight,
];

/// Snapshot source backed by gilrs.
///
/// `device_index` selects the N-th connected gamepad in gilrs' enumeration
/// order. Gilrs only updates its cached gamepad state while events are
/// drained, so every read empties the event queue first.
pub struct GilrsSource {
    gilrs: Gilrs,
    active_gamepad: Option<GamepadId>,
}

impl GilrsSource {
    pub fn open() -> Result<Self, DeviceError> {
        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => {
                info!("Successfully initialized gilrs");
                g
            }
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(DeviceError::InitializationError(e.to_string()));
            }
        };

        for (idx, (id, gamepad)) in gilrs.gamepads().enumerate() {
            info!(
                "  [{}] ID: {}, Name: {}, UUID: {:?}",
                idx,
                id,
                gamepad.name(),
                gamepad.uuid()
            );
        }

        Ok(Self {
            gilrs,
            active_gamepad: None,
        })
    }
}

impl SnapshotSource for GilrsSource {
    fn read(&mut self, device_index: usize) -> Result<Snapshot, DeviceError> {
        while let Some(event) = self.gilrs.next_event() {
            trace!("Drained gilrs event: {:?}", event);
        }

        let found = self
            .gilrs
            .gamepads()
            .nth(device_index)
            .map(|(id, gamepad)| {
                // gilrs reports y positive when pushed up
                let axes = Axes::new(
                    normalize_axis(gamepad.value(Axis::LeftStickX), -1.0, 1.0),
                    normalize_axis(-gamepad.value(Axis::LeftStickY), -1.0, 1.0),
                );
                let button_states = BUTTON_ORDER
                    .iter()
                    .map(|button| gamepad.is_pressed(*button))
                    .collect();
                (id, gamepad.name().to_string(), Snapshot::new(axes, button_states))
            });

        match found {
            Some((id, name, snapshot)) => {
                if self.active_gamepad != Some(id) {
                    info!("Selected gamepad: {} ({})", name, id);
                    self.active_gamepad = Some(id);
                }
                Ok(snapshot)
            }
            None => {
                if let Some(previous) = self.active_gamepad.take() {
                    warn!("Gamepad {} disconnected, retrying", previous);
                } else {
                    trace!("No gamepad at index {}", device_index);
                }
                Err(DeviceError::NotConnected(device_index))
            }
        }
    }
}
