//! Turns debounced joypad transitions into service commands.
//!
//! Two inputs, one per bus topic:
//!
//! - `state-changed`: the stick. A deflection past the threshold on exactly
//!   one axis moves the electrode selection in that direction. While the cycle
//!   button is held and candidates are known, left/right step through the
//!   candidates instead.
//! - `buttons-changed`: discrete actions, matched against the exact button
//!   delta in a fixed order (clear, cycle press, cycle release, previous,
//!   next, run). An unmatched chord of presses is only logged.
//!
//! The only state is the [`SessionContext`], shared with candidate lookup
//! callbacks through a mutex. The lock is never held while dispatching, so a
//! dispatcher may answer lookups synchronously.

pub mod command;
pub mod session;

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::bus::{BusEvent, EventBus, Topic};
use crate::controller::diff::{ButtonDelta, ChangeRecord};
use crate::dispatch::Dispatcher;

pub use command::{Command, Direction, ServiceNames};
pub use session::{decode_candidates, CandidateId, SessionContext};

/// Button indices (positions in `Snapshot::button_states`) and the stick
/// threshold the interpreter reacts to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonBindings {
    pub clear: usize,
    pub cycle: usize,
    pub nav_prev: usize,
    pub nav_next: usize,
    pub modifier: usize,
    pub run: usize,
    pub axis_threshold: f32,
}

impl Default for ButtonBindings {
    fn default() -> Self {
        Self {
            clear: 0,
            cycle: 3,
            nav_prev: 4,
            nav_next: 5,
            modifier: 8,
            run: 9,
            axis_threshold: 0.4,
        }
    }
}

impl ButtonBindings {
    pub fn indices(&self) -> [(&'static str, usize); 6] {
        [
            ("clear", self.clear),
            ("cycle", self.cycle),
            ("nav_prev", self.nav_prev),
            ("nav_next", self.nav_next),
            ("modifier", self.modifier),
            ("run", self.run),
        ]
    }
}

fn lock_session(session: &Mutex<SessionContext>) -> MutexGuard<'_, SessionContext> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CommandInterpreter {
    dispatcher: Arc<dyn Dispatcher>,
    bindings: ButtonBindings,
    services: ServiceNames,
    session: Arc<Mutex<SessionContext>>,
    most_recent: Mutex<Option<ChangeRecord>>,
}

impl CommandInterpreter {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        bindings: ButtonBindings,
        services: ServiceNames,
    ) -> Self {
        Self {
            dispatcher,
            bindings,
            services,
            session: Arc::new(Mutex::new(SessionContext::new())),
            most_recent: Mutex::new(None),
        }
    }

    pub fn with_session(self, session: SessionContext) -> Self {
        *lock_session(&self.session) = session;
        self
    }

    // Copy of the current session, for diagnostics
    pub fn session(&self) -> SessionContext {
        lock_session(&self.session).clone()
    }

    pub fn most_recent(&self) -> Option<ChangeRecord> {
        self.most_recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Subscribes this interpreter to both topics of `bus`.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let interpreter = self.clone();
        bus.subscribe(Topic::StateChanged, "interpreter/axes", move |event| {
            match event {
                BusEvent::StateChanged(record) => interpreter.on_state_changed(record),
                _ => Ok(()),
            }
        });

        let interpreter = self.clone();
        bus.subscribe(Topic::ButtonsChanged, "interpreter/buttons", move |event| {
            match event {
                BusEvent::ButtonsChanged { record, buttons } => {
                    interpreter.on_buttons_changed(record, buttons)
                }
                _ => Ok(()),
            }
        });
    }

    fn send(&self, command: Command) {
        info!("Dispatching {}", command);
        self.dispatcher.dispatch(command.to_call(&self.services), None);
    }

    pub fn on_state_changed(&self, record: &ChangeRecord) -> Result<()> {
        *self
            .most_recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(record.clone());

        let axes = record.new.axes;
        let Some(direction) = Direction::from_axes(axes.x, axes.y, self.bindings.axis_threshold)
        else {
            return Ok(());
        };

        if direction.is_horizontal() && record.new.is_pressed(self.bindings.cycle) {
            let focused = {
                let mut session = lock_session(&self.session);
                session.step(direction == Direction::Right).map(|candidate| {
                    (candidate, session.selection_index().unwrap_or_default())
                })
            };
            if let Some((candidate, index)) = focused {
                debug!("Cycled to candidate {} ({})", index, candidate);
                self.send(Command::FocusCandidate(candidate));
                return Ok(());
            }
        }

        self.send(Command::Move(direction));
        Ok(())
    }

    pub fn on_buttons_changed(&self, record: &ChangeRecord, buttons: &ButtonDelta) -> Result<()> {
        let b = &self.bindings;
        debug!("Buttons changed: {}", buttons);

        if buttons.is_exactly(b.clear, true) {
            self.send(Command::ClearActuation);
        } else if buttons.is_exactly(b.cycle, true) {
            self.begin_cycle();
        } else if buttons.is_exactly(b.cycle, false) {
            self.commit_cycle();
        } else if buttons.is_exactly(b.nav_prev, true) {
            if record.new.is_pressed(b.modifier) {
                self.send(Command::FirstStep);
            } else {
                self.send(Command::PreviousStep);
            }
        } else if buttons.is_exactly(b.nav_next, true) {
            if record.new.is_pressed(b.modifier) {
                self.send(Command::LastStep);
            } else {
                self.send(Command::NextStep);
            }
        } else if buttons.is_exactly(b.run, true) {
            self.send(Command::Run);
        } else if buttons.all_pressed() {
            info!(
                "Unbound chord {} (old: {}, new: {}, diff: {})",
                buttons, record.old, record.new, record.diff
            );
        } else {
            debug!("No command for button change {}", buttons);
        }
        Ok(())
    }

    fn begin_cycle(&self) {
        let ticket = lock_session(&self.session).begin();
        let session = self.session.clone();

        info!("Dispatching {}", Command::FindCandidates);
        self.dispatcher.dispatch(
            Command::FindCandidates.to_call(&self.services),
            Some(Box::new(move |reply| {
                let candidates = decode_candidates(&reply);
                let count = candidates.len();
                if lock_session(&session).resolve(ticket, candidates) {
                    info!("Found {} candidates", count);
                }
            })),
        );
    }

    fn commit_cycle(&self) {
        let (selected, state) = {
            let mut session = lock_session(&self.session);
            let state = format!("{:?}", *session);
            (session.commit(), state)
        };
        info!("Cycle button released: {}", state);

        if let Some(candidate) = selected {
            self.send(Command::ClearActuation);
            self.send(Command::SetActuation(candidate));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::snapshot::{Axes, Snapshot};
    use crate::dispatch::{ReplyCallback, ServiceCall};
    use serde_json::{json, Value};

    const BUTTONS: usize = 10;

    // Records calls; answers lookups inline with `reply`, or parks the
    // callback when `reply` is None
    #[derive(Default)]
    struct RecordingDispatcher {
        calls: Mutex<Vec<ServiceCall>>,
        reply: Option<Value>,
        parked: Mutex<Vec<ReplyCallback>>,
    }

    impl RecordingDispatcher {
        fn answering(reply: Value) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply),
                ..Self::default()
            })
        }

        fn commands(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.command.clone())
                .collect()
        }

        fn take(&self) -> Vec<ServiceCall> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    impl Dispatcher for RecordingDispatcher {
        fn dispatch(&self, call: ServiceCall, on_result: Option<ReplyCallback>) {
            self.calls.lock().unwrap().push(call);
            if let Some(callback) = on_result {
                match &self.reply {
                    Some(reply) => callback(reply.clone()),
                    None => self.parked.lock().unwrap().push(callback),
                }
            }
        }
    }

    fn interpreter(dispatcher: &Arc<RecordingDispatcher>) -> CommandInterpreter {
        CommandInterpreter::new(
            dispatcher.clone(),
            ButtonBindings::default(),
            ServiceNames::default(),
        )
    }

    fn snapshot(x: f32, y: f32, pressed: &[usize]) -> Snapshot {
        let mut buttons = vec![false; BUTTONS];
        for &i in pressed {
            buttons[i] = true;
        }
        Snapshot::new(Axes::new(x, y), buttons)
    }

    // Drives the interpreter with one accepted transition, the way the bus does
    struct Pad<'a> {
        interpreter: &'a CommandInterpreter,
        current: Snapshot,
    }

    impl<'a> Pad<'a> {
        fn new(interpreter: &'a CommandInterpreter) -> Self {
            Self {
                interpreter,
                current: snapshot(0.0, 0.0, &[]),
            }
        }

        fn to(&mut self, next: Snapshot) {
            let record = ChangeRecord::new(std::mem::replace(&mut self.current, next.clone()), next);
            self.interpreter.on_state_changed(&record).unwrap();
            if let Some(buttons) = record.button_delta() {
                self.interpreter.on_buttons_changed(&record, &buttons).unwrap();
            }
        }
    }

    #[test]
    fn single_axis_deflection_moves() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.5, 0.1, &[]));
        let calls = dispatcher.take();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, "set_electrode_direction_states");
        assert_eq!(calls[0].args["direction"], json!("right"));

        pad.to(snapshot(0.0, -0.45, &[]));
        assert_eq!(dispatcher.take()[0].args["direction"], json!("up"));
    }

    #[test]
    fn diagonal_deflection_is_dropped() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.5, 0.5, &[]));
        pad.to(snapshot(0.0, 0.0, &[]));
        assert!(dispatcher.commands().is_empty());
        assert!(interpreter.most_recent().is_some());
    }

    #[test]
    fn single_buttons_map_to_commands() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        for button in [0, 4, 5, 9] {
            pad.to(snapshot(0.0, 0.0, &[button]));
            pad.to(snapshot(0.0, 0.0, &[]));
        }

        assert_eq!(
            dispatcher.commands(),
            vec!["clear_electrode_states", "prev_step", "next_step", "run_protocol"]
        );
    }

    #[test]
    fn modifier_turns_navigation_into_jumps() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[8]));
        pad.to(snapshot(0.0, 0.0, &[8, 4]));
        pad.to(snapshot(0.0, 0.0, &[8]));
        pad.to(snapshot(0.0, 0.0, &[8, 5]));

        assert_eq!(dispatcher.commands(), vec!["first_step", "last_step"]);
    }

    #[test]
    fn simultaneous_press_matches_no_single_rule() {
        let dispatcher = Arc::new(RecordingDispatcher::answering(json!(["A"])));
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        // {0: true, 3: true} is neither "clear" nor "cycle": diagnostic only
        pad.to(snapshot(0.0, 0.0, &[0, 3]));
        assert!(dispatcher.commands().is_empty());

        // a mixed chord is ignored as well
        pad.to(snapshot(0.0, 0.0, &[4]));
        assert!(dispatcher.commands().is_empty());
    }

    #[test]
    fn cycling_wraps_and_release_commits() {
        let dispatcher = RecordingDispatcher::answering(json!(["A", "B", "C"]));
        let interpreter = interpreter(&dispatcher).with_session(SessionContext::with_candidates(
            vec!["A".into(), "B".into(), "C".into()],
        ));
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[3]));
        assert_eq!(dispatcher.commands(), vec!["find_candidates"]);
        assert_eq!(interpreter.session().candidates().len(), 3);
        dispatcher.take();

        let mut indices = Vec::new();
        for _ in 0..4 {
            pad.to(snapshot(0.5, 0.0, &[3]));
            pad.to(snapshot(0.0, 0.0, &[3]));
            indices.push(interpreter.session().selection_index().unwrap());
        }
        assert_eq!(indices, vec![0, 1, 2, 0]);

        let focused: Vec<Value> = dispatcher
            .take()
            .iter()
            .map(|c| c.args["electrode_id"].clone())
            .collect();
        assert_eq!(focused, vec![json!("A"), json!("B"), json!("C"), json!("A")]);

        pad.to(snapshot(0.5, 0.0, &[3]));
        pad.to(snapshot(0.0, 0.0, &[3]));
        assert_eq!(interpreter.session().selection_index(), Some(1));
        dispatcher.take();

        pad.to(snapshot(0.0, 0.0, &[]));
        let calls = dispatcher.take();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].command, "clear_electrode_states");
        assert_eq!(calls[1].command, "set_electrode_states");
        assert_eq!(calls[1].args["electrode_states"], json!({"B": true}));
        assert_eq!(interpreter.session(), {
            let mut cleared = SessionContext::new();
            cleared.begin();
            cleared.clear();
            cleared
        });
    }

    #[test]
    fn left_from_no_selection_picks_last() {
        let dispatcher = RecordingDispatcher::answering(json!(["A", "B", "C"]));
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[3]));
        pad.to(snapshot(-0.5, 0.0, &[3]));

        assert_eq!(interpreter.session().selection_index(), Some(2));
    }

    #[test]
    fn vertical_moves_while_cycling() {
        let dispatcher = RecordingDispatcher::answering(json!(["A", "B"]));
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[3]));
        dispatcher.take();
        pad.to(snapshot(0.0, 0.5, &[3]));

        assert_eq!(dispatcher.take()[0].args["direction"], json!("down"));
        assert_eq!(interpreter.session().selection_index(), None);
    }

    #[test]
    fn cycling_before_lookup_answers_moves_instead() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[3]));
        pad.to(snapshot(0.5, 0.0, &[3]));

        assert_eq!(
            dispatcher.commands(),
            vec!["find_candidates", "set_electrode_direction_states"]
        );
    }

    #[test]
    fn release_without_selection_dispatches_nothing() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher);
        let mut pad = Pad::new(&interpreter);

        pad.to(snapshot(0.0, 0.0, &[3]));
        pad.to(snapshot(0.0, 0.0, &[]));
        assert_eq!(dispatcher.commands(), vec!["find_candidates"]);

        // the late answer still lands, the session was never committed
        let callback = dispatcher.parked.lock().unwrap().pop().unwrap();
        callback(json!(["A", "B"]));
        assert_eq!(interpreter.session().candidates().len(), 2);
    }

    #[test]
    fn prior_selection_survives_a_new_press() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = interpreter(&dispatcher).with_session(SessionContext::with_candidates(
            vec!["A".into(), "B".into(), "C".into()],
        ));
        let mut pad = Pad::new(&interpreter);

        // cycle held from the first accepted state, so no press is seen yet
        pad.current = snapshot(0.0, 0.0, &[3]);
        pad.to(snapshot(0.5, 0.0, &[3]));
        pad.to(snapshot(0.0, 0.0, &[3]));
        pad.to(snapshot(0.5, 0.0, &[3]));
        assert_eq!(interpreter.session().selection_index(), Some(1));

        // release and press arrive merged with another button: no commit
        pad.to(snapshot(0.0, 0.0, &[0]));
        pad.to(snapshot(0.0, 0.0, &[]));
        pad.to(snapshot(0.0, 0.0, &[3]));

        let callback = dispatcher.parked.lock().unwrap().pop().unwrap();
        callback(json!(["X", "Y", "Z"]));
        assert_eq!(
            interpreter.session().selected(),
            Some(&CandidateId::from("Y"))
        );
    }

    #[test]
    fn registered_interpreter_reacts_to_bus_events() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let interpreter = Arc::new(interpreter(&dispatcher));
        let bus = EventBus::new();
        interpreter.register(&bus);

        bus.publish_transition(ChangeRecord::new(
            snapshot(0.0, 0.0, &[]),
            snapshot(0.0, 0.0, &[9]),
        ));
        bus.publish_transition(ChangeRecord::new(
            snapshot(0.0, 0.0, &[9]),
            snapshot(-0.5, 0.0, &[9]),
        ));

        assert_eq!(
            dispatcher.commands(),
            vec!["run_protocol", "set_electrode_direction_states"]
        );
    }
}
