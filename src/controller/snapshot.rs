use serde::{Deserialize, Serialize};
use std::fmt;

// Normalised stick position, both axes in [-0.5, 0.5] with 0 at rest.
// Positive y points down.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Axes {
    pub x: f32,
    pub y: f32,
}

// Axis names as they appear in a structural diff
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AxisName {
    X,
    Y,
}

impl fmt::Display for AxisName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AxisName::X => write!(f, "x"),
            AxisName::Y => write!(f, "y"),
        }
    }
}

impl Axes {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn get(&self, axis: AxisName) -> f32 {
        match axis {
            AxisName::X => self.x,
            AxisName::Y => self.y,
        }
    }
}

/// One fully-read sample of device axis and button state.
///
/// Snapshots are never mutated after they are produced; the settle detector and
/// the diff engine compare them by value. Button order is fixed by the source
/// for the lifetime of a session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub axes: Axes,
    pub button_states: Vec<bool>,
}

impl Snapshot {
    pub fn new(axes: Axes, button_states: Vec<bool>) -> Self {
        Self {
            axes,
            button_states,
        }
    }

    /// The sentinel the settle detector starts from. It has no buttons, so the
    /// first accepted snapshot never yields a button delta.
    pub fn empty() -> Self {
        Self::default()
    }

    /// State of button `index`; buttons the device does not report read as released.
    pub fn is_pressed(&self, index: usize) -> bool {
        self.button_states.get(index).copied().unwrap_or(false)
    }

    pub fn pressed_buttons(&self) -> Vec<usize> {
        self.button_states
            .iter()
            .enumerate()
            .filter_map(|(i, pressed)| pressed.then_some(i))
            .collect()
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "x:{:.3} y:{:.3} pressed:{:?}",
            self.axes.x,
            self.axes.y,
            self.pressed_buttons()
        )
    }
}

/// Maps a raw reading from a device range onto [-0.5, 0.5].
///
/// A degenerate range (`max <= min`) maps everything to the centre.
pub fn normalize_axis(raw: f32, min: f32, max: f32) -> f32 {
    if max <= min {
        return 0.0;
    }
    let clamped = raw.clamp(min, max);
    (clamped - min) / (max - min) - 0.5
}
