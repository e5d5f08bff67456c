use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Opaque identifier of a selectable candidate (an electrode id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateId(String);

impl CandidateId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    // Non-string ids are kept in their JSON form
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) => CandidateId(s.clone()),
            other => CandidateId(other.to_string()),
        }
    }
}

impl From<&str> for CandidateId {
    fn from(value: &str) -> Self {
        CandidateId(value.to_string())
    }
}

impl From<String> for CandidateId {
    fn from(value: String) -> Self {
        CandidateId(value)
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handed out when a cycling session begins; redeemed when the candidate
/// lookup answers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionTicket {
    generation: u64,
    prior_index: Option<usize>,
}

/// State of one press-hold-release cycle.
///
/// `selection_index` is always a valid index into `candidates`. Every session
/// start and every commit bumps the generation, so a lookup answer that
/// arrives after its session was committed is discarded instead of
/// resurrecting a finished selection.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionContext {
    selection_index: Option<usize>,
    candidates: Vec<CandidateId>,
    generation: u64,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candidates(candidates: Vec<CandidateId>) -> Self {
        Self {
            candidates,
            ..Self::default()
        }
    }

    pub fn selection_index(&self) -> Option<usize> {
        self.selection_index
    }

    pub fn candidates(&self) -> &[CandidateId] {
        &self.candidates
    }

    pub fn has_candidates(&self) -> bool {
        !self.candidates.is_empty()
    }

    pub fn selected(&self) -> Option<&CandidateId> {
        self.selection_index.and_then(|i| self.candidates.get(i))
    }

    /// Starts a new session: forgets the candidates and parks the current
    /// index in the returned ticket.
    pub fn begin(&mut self) -> SessionTicket {
        self.generation += 1;
        self.candidates.clear();
        SessionTicket {
            generation: self.generation,
            prior_index: self.selection_index.take(),
        }
    }

    /// Installs the looked-up candidates for `ticket`'s session. The parked
    /// index is restored if it still fits. Returns false for a stale ticket.
    pub fn resolve(&mut self, ticket: SessionTicket, candidates: Vec<CandidateId>) -> bool {
        if ticket.generation != self.generation {
            debug!(
                "Discarding candidates for session {} (current {})",
                ticket.generation, self.generation
            );
            return false;
        }
        self.selection_index = ticket.prior_index.filter(|i| *i < candidates.len());
        self.candidates = candidates;
        true
    }

    /// Moves the selection one candidate forward or back, wrapping around.
    /// From no selection, forward lands on the first candidate and back on
    /// the last.
    pub fn step(&mut self, forward: bool) -> Option<CandidateId> {
        let count = self.candidates.len();
        if count == 0 {
            return None;
        }
        let next = match (self.selection_index, forward) {
            (Some(i), true) => (i + 1) % count,
            (Some(i), false) => (i + count - 1) % count,
            (None, true) => 0,
            (None, false) => count - 1,
        };
        self.selection_index = Some(next);
        self.candidates.get(next).cloned()
    }

    /// Takes the selected candidate and ends the session. Without a selection
    /// the context is left untouched.
    pub fn commit(&mut self) -> Option<CandidateId> {
        let selected = self.selected().cloned()?;
        self.clear();
        Some(selected)
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.selection_index = None;
        self.candidates.clear();
    }
}

/// Decodes a candidate lookup reply. Anything but a JSON array is no candidates.
pub fn decode_candidates(reply: &Value) -> Vec<CandidateId> {
    match reply {
        Value::Array(items) => items.iter().map(CandidateId::from_value).collect(),
        _ => Vec::new(),
    }
}
