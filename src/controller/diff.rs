//! Typed structural comparison between two snapshots.
//!
//! [`diff`] lists every leaf that differs between two snapshots. Buttons that
//! exist in only one of them (the empty sentinel, or a device that changed its
//! report size) show up as added or removed leaves and are never part of a
//! [`ButtonDelta`]; only buttons present on both sides whose value flipped are.

use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::fmt;

use super::snapshot::{AxisName, Snapshot};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FieldPath {
    Axis(AxisName),
    Button(usize),
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Axis(axis) => write!(f, "axes.{}", axis),
            FieldPath::Button(index) => write!(f, "button_states[{}]", index),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LeafValue {
    Float(f32),
    Bool(bool),
}

impl fmt::Display for LeafValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeafValue::Float(v) => write!(f, "{:.3}", v),
            LeafValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

// One differing leaf. `None` on a side means the leaf does not exist there.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub path: FieldPath,
    pub old_value: Option<LeafValue>,
    pub new_value: Option<LeafValue>,
}

impl FieldChange {
    // Present on both sides with a different value
    pub fn is_value_change(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_some()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructuralDiff {
    changes: Vec<FieldChange>,
}

impl StructuralDiff {
    pub fn changes(&self) -> &[FieldChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn values_changed(&self) -> impl Iterator<Item = &FieldChange> {
        self.changes.iter().filter(|c| c.is_value_change())
    }

    /// Extracts the new value of every button that flipped.
    ///
    /// Returns `None` rather than an empty delta when no button flipped, which
    /// is what suppresses the `buttons-changed` topic.
    pub fn button_delta(&self) -> Option<ButtonDelta> {
        let flips: BTreeMap<usize, bool> = self
            .values_changed()
            .filter_map(|change| match (change.path, change.new_value) {
                (FieldPath::Button(index), Some(LeafValue::Bool(value))) => Some((index, value)),
                _ => None,
            })
            .collect();

        if flips.is_empty() {
            None
        } else {
            Some(ButtonDelta(flips))
        }
    }
}

impl fmt::Display for StructuralDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for change in &self.changes {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            let old = change
                .old_value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            let new = change
                .new_value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string());
            write!(f, "{}: {} -> {}", change.path, old, new)?;
        }
        Ok(())
    }
}

/// Compares two snapshots leaf by leaf.
pub fn diff(old: &Snapshot, new: &Snapshot) -> StructuralDiff {
    let mut changes = Vec::new();

    for axis in [AxisName::X, AxisName::Y] {
        let (before, after) = (old.axes.get(axis), new.axes.get(axis));
        if before != after {
            changes.push(FieldChange {
                path: FieldPath::Axis(axis),
                old_value: Some(LeafValue::Float(before)),
                new_value: Some(LeafValue::Float(after)),
            });
        }
    }

    let count = old.button_states.len().max(new.button_states.len());
    for index in 0..count {
        let before = old.button_states.get(index).copied();
        let after = new.button_states.get(index).copied();
        if before != after {
            changes.push(FieldChange {
                path: FieldPath::Button(index),
                old_value: before.map(LeafValue::Bool),
                new_value: after.map(LeafValue::Bool),
            });
        }
    }

    StructuralDiff { changes }
}

/// New values of the buttons that flipped in one accepted transition, keyed
/// by button index. The old value is the negation of the new one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ButtonDelta(BTreeMap<usize, bool>);

impl ButtonDelta {
    pub fn get(&self, index: usize) -> Option<bool> {
        self.0.get(&index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, bool)> + '_ {
        self.0.iter().map(|(index, value)| (*index, *value))
    }

    /// True if this delta is exactly `{index: value}`.
    pub fn is_exactly(&self, index: usize, value: bool) -> bool {
        self.0.len() == 1 && self.get(index) == Some(value)
    }

    // Every reported transition was a press
    pub fn all_pressed(&self) -> bool {
        self.0.values().all(|value| *value)
    }
}

impl FromIterator<(usize, bool)> for ButtonDelta {
    fn from_iter<T: IntoIterator<Item = (usize, bool)>>(iter: T) -> Self {
        ButtonDelta(iter.into_iter().collect())
    }
}

impl fmt::Display for ButtonDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// One accepted state transition.
#[derive(Clone, Debug)]
pub struct ChangeRecord {
    pub old: Snapshot,
    pub new: Snapshot,
    pub diff: StructuralDiff,
    pub accepted_at: DateTime<Local>,
}

impl ChangeRecord {
    pub fn new(old: Snapshot, new: Snapshot) -> Self {
        let diff = diff(&old, &new);
        Self {
            old,
            new,
            diff,
            accepted_at: Local::now(),
        }
    }

    pub fn button_delta(&self) -> Option<ButtonDelta> {
        self.diff.button_delta()
    }
}
