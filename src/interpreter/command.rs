use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::dispatch::ServiceCall;

use super::session::CandidateId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }

    pub fn is_horizontal(&self) -> bool {
        matches!(self, Direction::Left | Direction::Right)
    }

    /// Direction of a stick deflection, if exactly one axis is past
    /// `threshold`. A diagonal past the threshold on both axes yields nothing.
    pub fn from_axes(x: f32, y: f32, threshold: f32) -> Option<Self> {
        let horizontal = x.abs() > threshold;
        let vertical = y.abs() > threshold;

        match (horizontal, vertical) {
            (true, false) if x > 0.0 => Some(Direction::Right),
            (true, false) => Some(Direction::Left),
            (false, true) if y > 0.0 => Some(Direction::Down),
            (false, true) => Some(Direction::Up),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote service names commands are addressed to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceNames {
    /// Owns electrode actuation state
    pub actuation: String,
    /// Hardware side: liquid detection and electrode identification
    pub detection: String,
    /// Protocol step navigation
    pub protocol: String,
}

impl Default for ServiceNames {
    fn default() -> Self {
        Self {
            actuation: "electrode_controller".to_string(),
            detection: "dropbot".to_string(),
            protocol: "protocol_controller".to_string(),
        }
    }
}

/// Semantic commands produced by the interpreter.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    ClearActuation,
    SetActuation(CandidateId),
    Move(Direction),
    FocusCandidate(CandidateId),
    FindCandidates,
    FirstStep,
    PreviousStep,
    NextStep,
    LastStep,
    Run,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ClearActuation => "clear_electrode_states",
            Command::SetActuation(_) => "set_electrode_states",
            Command::Move(_) => "set_electrode_direction_states",
            Command::FocusCandidate(_) => "identify_electrode",
            Command::FindCandidates => "find_candidates",
            Command::FirstStep => "first_step",
            Command::PreviousStep => "prev_step",
            Command::NextStep => "next_step",
            Command::LastStep => "last_step",
            Command::Run => "run_protocol",
        }
    }

    pub fn to_call(&self, services: &ServiceNames) -> ServiceCall {
        let service = match self {
            Command::ClearActuation | Command::SetActuation(_) | Command::Move(_) => {
                &services.actuation
            }
            Command::FocusCandidate(_) | Command::FindCandidates => &services.detection,
            Command::FirstStep
            | Command::PreviousStep
            | Command::NextStep
            | Command::LastStep
            | Command::Run => &services.protocol,
        };
        let call = ServiceCall::new(service.clone(), self.name());

        match self {
            Command::SetActuation(candidate) => {
                let mut states = Map::new();
                states.insert(candidate.to_string(), Value::Bool(true));
                call.arg("electrode_states", Value::Object(states))
            }
            Command::Move(direction) => call.arg("direction", direction.as_str()),
            Command::FocusCandidate(candidate) => {
                call.arg("electrode_id", json!(candidate.as_str()))
            }
            _ => call,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetActuation(candidate) | Command::FocusCandidate(candidate) => {
                write!(f, "{}({})", self.name(), candidate)
            }
            Command::Move(direction) => write!(f, "{}({})", self.name(), direction),
            _ => f.write_str(self.name()),
        }
    }
}
