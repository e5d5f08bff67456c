//! Joypad → command pipeline for a digital microfluidics controller.
//!
//! ```text
//! Source ──► Poller ──► SettleDetector ──► diff ──► EventBus ──► CommandInterpreter ──► Dispatcher
//! ```
//!
//! [`control::JoypadControl`] wires the pieces together and owns their
//! lifecycle.

pub mod bus;
pub mod config;
pub mod control;
pub mod controller;
pub mod dispatch;
pub mod interpreter;
