//! Finite state machine for one-shot watch registrations.
//!
//! Coordination watches fire at most once per registration, so every path
//! the watcher cares about cycles through `Unwatched -> Watching -> Firing
//! -> Watching`. The re-arm (`Firing -> Watching`) happens before the
//! notification's payload is applied, so a change landing in between still
//! produces a notification. Rejecting `Armed` on a path that is already
//! watched guarantees one registration per discovery.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

/// Registration state of a watched path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WatchState {
    /// No watch registered
    #[default]
    Unwatched,
    /// A watch is registered and waiting
    Watching,
    /// The watch fired and has not been re-registered yet
    Firing,
}

impl fmt::Display for WatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchState::Unwatched => write!(f, "Unwatched"),
            WatchState::Watching => write!(f, "Watching"),
            WatchState::Firing => write!(f, "Firing"),
        }
    }
}

/// Events that drive watch state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchTrigger {
    /// A first registration was issued
    Armed,
    /// The registered watch delivered its notification
    Fired,
    /// The watch was registered again after firing
    Rearmed,
    /// The path is no longer of interest (node deleted, session lost)
    Dropped,
}

impl fmt::Display for WatchTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTrigger::Armed => write!(f, "Armed"),
            WatchTrigger::Fired => write!(f, "Fired"),
            WatchTrigger::Rearmed => write!(f, "Rearmed"),
            WatchTrigger::Dropped => write!(f, "Dropped"),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    /// Source state
    pub from: WatchState,
    /// Target state
    pub to: WatchState,
    /// Trigger for this transition
    pub trigger: WatchTrigger,
    /// Human-readable description of this transition
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: WatchState,
        to: WatchState,
        trigger: WatchTrigger,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            trigger,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq, Eq)]
pub enum TransitionResult {
    /// Transition was successful
    Success {
        from: WatchState,
        to: WatchState,
        trigger: WatchTrigger,
        description: &'static str,
    },
    /// Transition was not valid for current state
    InvalidTransition {
        current: WatchState,
        trigger: WatchTrigger,
    },
}

impl TransitionResult {
    /// Check if the transition was applied
    pub fn is_success(&self) -> bool {
        matches!(self, TransitionResult::Success { .. })
    }
}

/// Transition table for watch registrations
pub struct WatchStateMachine {
    transitions: Vec<Transition>,
}

impl Default for WatchStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchStateMachine {
    /// Create a new state machine with the defined transition table
    pub fn new() -> Self {
        Self {
            transitions: vec![
                Transition::new(
                    WatchState::Unwatched,
                    WatchState::Watching,
                    WatchTrigger::Armed,
                    "Watch registered for newly discovered path",
                ),
                Transition::new(
                    WatchState::Watching,
                    WatchState::Firing,
                    WatchTrigger::Fired,
                    "Watch delivered its notification",
                ),
                Transition::new(
                    WatchState::Firing,
                    WatchState::Watching,
                    WatchTrigger::Rearmed,
                    "Watch re-registered after firing",
                ),
                Transition::new(
                    WatchState::Watching,
                    WatchState::Unwatched,
                    WatchTrigger::Dropped,
                    "Path no longer tracked",
                ),
                Transition::new(
                    WatchState::Firing,
                    WatchState::Unwatched,
                    WatchTrigger::Dropped,
                    "Path vanished before re-registration",
                ),
            ],
        }
    }

    /// Attempt to transition to a new state based on a trigger
    pub fn transition(&self, current: WatchState, trigger: WatchTrigger) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.trigger == trigger)
        {
            Some(t) => TransitionResult::Success {
                from: t.from,
                to: t.to,
                trigger,
                description: t.description,
            },
            None => TransitionResult::InvalidTransition { current, trigger },
        }
    }

    /// Check if a transition is valid
    pub fn can_transition(&self, from: WatchState, trigger: WatchTrigger) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.trigger == trigger)
    }

    /// Get all valid triggers for a given state
    pub fn valid_triggers(&self, state: WatchState) -> Vec<WatchTrigger> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.trigger)
            .collect()
    }
}

/// Watch state of every path the watcher knows about
#[derive(Default)]
pub struct WatchTable {
    machine: WatchStateMachine,
    states: HashMap<String, WatchState>,
}

impl WatchTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of `path`
    pub fn state(&self, path: &str) -> WatchState {
        self.states.get(path).copied().unwrap_or_default()
    }

    /// Apply `trigger` to `path`, returning whether the transition was valid.
    ///
    /// Invalid transitions leave the state unchanged.
    pub fn apply(&mut self, path: &str, trigger: WatchTrigger) -> bool {
        let current = self.state(path);
        match self.machine.transition(current, trigger) {
            TransitionResult::Success { to, description, .. } => {
                debug!(path, from = %current, to = %to, "{}", description);
                if to == WatchState::Unwatched {
                    self.states.remove(path);
                } else {
                    self.states.insert(path.to_string(), to);
                }
                true
            }
            TransitionResult::InvalidTransition { .. } => {
                debug!(path, state = %current, trigger = %trigger, "Ignoring invalid watch transition");
                false
            }
        }
    }

    /// Number of paths currently watched or firing
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if no path is watched
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Forget every registration (session lost)
    pub fn reset(&mut self) {
        self.states.clear();
    }
}
