//! Joypad input subsystem
//!
//! Implements the sampling half of the pipeline:
//!
//! 1. [`source`] - Raw snapshot reads (gilrs backed, or scripted in tests)
//! 2. [`settle`] - Leading-edge debounce over whole snapshots
//! 3. [`diff`] - Structural diff and change records
//! 4. [`poller`] - Poll loop and worker lifecycle
//!
//! # Architecture
//!
//! ```text
//! Joypad ──► Source ──► SettleDetector ──► ChangeRecord ──► EventBus
//!            (1ms)      (10ms settle)      (old, new, diff)
//! ```
//!
//! The poller runs on its own OS thread with a current-thread tokio runtime,
//! so a slow subscriber delays the next read but never blocks the caller.

pub mod diff;
pub mod poller;
pub mod settle;
pub mod snapshot;
pub mod source;

pub use diff::{diff, ButtonDelta, ChangeRecord, StructuralDiff};
pub use poller::{Poller, PollerError, PollerHandle, PollerSettings};
pub use settle::SettleDetector;
pub use snapshot::{Axes, AxisName, Snapshot};
pub use source::{DeviceError, GilrsSource, SnapshotSource};
