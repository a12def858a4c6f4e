//! Conversational turn state.
//!
//! ```text
//!            wake_detected            start_thinking
//!   Idle ─────────────────▶ Awake ─────────────────▶ Thinking
//!    ▲                      │  ▲                        │
//!    │        start_speaking│  │finish_speaking         │start_speaking
//!    │                      ▼  │                        ▼
//!    │                     Speaking ◀───────────────────┘
//!    └──── session_end (from Awake, Thinking or Speaking)
//! ```
//!
//! The current state lives in a `watch` channel so status readers never block
//! the loop; every accepted transition is also published on a `broadcast`
//! channel for clients that want the full sequence.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use companion_voice::Route;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Awake,
    Thinking,
    Speaking,
}

impl TurnState {
    /// Status vocabulary reported to clients.
    pub fn status_label(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Awake => "listening",
            TurnState::Thinking => "thinking",
            TurnState::Speaking => "speaking",
        }
    }

    /// Where incoming frames go in this state.
    pub fn route(&self) -> Route {
        match self {
            TurnState::Idle => Route::Wake,
            _ => Route::Segmenter,
        }
    }

    pub fn in_session(&self) -> bool {
        *self != TurnState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEvent {
    WakeDetected,
    StartThinking,
    StartSpeaking,
    FinishSpeaking,
    SessionEnd,
}

/// The closed transition table. `None` means the pair is illegal.
pub fn next_state(from: TurnState, event: TurnEvent) -> Option<TurnState> {
    use TurnEvent::*;
    use TurnState::*;
    match (from, event) {
        (Idle, WakeDetected) => Some(Awake),
        (Awake, StartThinking) => Some(Thinking),
        (Thinking | Awake, StartSpeaking) => Some(Speaking),
        (Speaking, FinishSpeaking) => Some(Awake),
        (Awake | Thinking | Speaking, SessionEnd) => Some(Idle),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub from: TurnState,
    pub to: TurnState,
    pub event: TurnEvent,
    pub at: DateTime<Utc>,
}

/// Sole owner of the current [`TurnState`].
pub struct TurnStateMachine {
    state: watch::Sender<TurnState>,
    transitions: broadcast::Sender<Transition>,
}

impl Default for TurnStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnStateMachine {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TurnState::Idle);
        let (transitions, _) = broadcast::channel(64);
        Self { state, transitions }
    }

    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Follow the current state.
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// Receive every accepted transition from now on.
    pub fn transitions(&self) -> broadcast::Receiver<Transition> {
        self.transitions.subscribe()
    }

    /// Apply an event. An illegal event leaves the state unchanged and is reported.
    pub fn apply(&self, event: TurnEvent) -> CoreResult<TurnState> {
        // the closure always runs; the initial value is never observed
        let mut outcome = Err(TurnState::Idle);
        self.state.send_if_modified(|state| {
            let from = *state;
            match next_state(from, event) {
                Some(to) => {
                    *state = to;
                    outcome = Ok((from, to));
                    true
                }
                None => {
                    outcome = Err(from);
                    false
                }
            }
        });

        match outcome {
            Ok((from, to)) => {
                debug!(target: "companion::state", "{:?} --{:?}--> {:?}", from, event, to);
                // no subscribers is fine
                let _ = self.transitions.send(Transition {
                    from,
                    to,
                    event,
                    at: Utc::now(),
                });
                Ok(to)
            }
            Err(from) => {
                warn!(target: "companion::state", "Ignoring {:?} while {:?}", event, from);
                Err(CoreError::InvalidTransition { from, event })
            }
        }
    }

    pub fn wake_detected(&self) -> CoreResult<TurnState> {
        self.apply(TurnEvent::WakeDetected)
    }

    pub fn start_thinking(&self) -> CoreResult<TurnState> {
        self.apply(TurnEvent::StartThinking)
    }

    pub fn start_speaking(&self) -> CoreResult<TurnState> {
        self.apply(TurnEvent::StartSpeaking)
    }

    pub fn finish_speaking(&self) -> CoreResult<TurnState> {
        self.apply(TurnEvent::FinishSpeaking)
    }

    pub fn session_end(&self) -> CoreResult<TurnState> {
        self.apply(TurnEvent::SessionEnd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [TurnState; 4] = [
        TurnState::Idle,
        TurnState::Awake,
        TurnState::Thinking,
        TurnState::Speaking,
    ];
    const EVENTS: [TurnEvent; 5] = [
        TurnEvent::WakeDetected,
        TurnEvent::StartThinking,
        TurnEvent::StartSpeaking,
        TurnEvent::FinishSpeaking,
        TurnEvent::SessionEnd,
    ];

    /// Drive a fresh machine into `target` through legal events.
    fn machine_in(target: TurnState) -> TurnStateMachine {
        let m = TurnStateMachine::new();
        match target {
            TurnState::Idle => {}
            TurnState::Awake => {
                m.wake_detected().unwrap();
            }
            TurnState::Thinking => {
                m.wake_detected().unwrap();
                m.start_thinking().unwrap();
            }
            TurnState::Speaking => {
                m.wake_detected().unwrap();
                m.start_speaking().unwrap();
            }
        }
        assert_eq!(m.state(), target);
        m
    }

    #[test]
    fn table_is_closed() {
        let mut legal = 0;
        for from in STATES {
            for event in EVENTS {
                let m = machine_in(from);
                match (next_state(from, event), m.apply(event)) {
                    (Some(to), Ok(now)) => {
                        legal += 1;
                        assert_eq!(now, to);
                        assert_eq!(m.state(), to);
                    }
                    (None, Err(CoreError::InvalidTransition { from: f, event: e })) => {
                        assert_eq!((f, e), (from, event));
                        assert_eq!(m.state(), from, "illegal event must not move state");
                    }
                    (expected, got) => panic!("{:?}/{:?}: {:?} vs {:?}", from, event, expected, got),
                }
            }
        }
        // wake, think, speak x2, finish, end x3
        assert_eq!(legal, 8);
    }

    #[test]
    fn transitions_are_published() {
        let m = TurnStateMachine::new();
        let mut rx = m.transitions();
        let mut watch = m.subscribe();

        m.wake_detected().unwrap();
        assert!(m.finish_speaking().is_err());
        m.start_thinking().unwrap();

        let first = rx.try_recv().unwrap();
        assert_eq!((first.from, first.to), (TurnState::Idle, TurnState::Awake));
        let second = rx.try_recv().unwrap();
        assert_eq!(second.event, TurnEvent::StartThinking);
        assert!(rx.try_recv().is_err());

        assert!(watch.has_changed().unwrap());
        assert_eq!(*watch.borrow_and_update(), TurnState::Thinking);
    }

    #[test]
    fn status_labels() {
        assert_eq!(TurnState::Awake.status_label(), "listening");
        assert_eq!(TurnState::Idle.route(), Route::Wake);
        assert_eq!(TurnState::Speaking.route(), Route::Segmenter);
    }
}
