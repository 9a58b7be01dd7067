//! ClipWorkflow state machine
//!
//! All transitions go through [`ClipState::can_transition_to`]; callers
//! that hit an invalid edge get it rejected instead of silently applied.
//!
//! ```text
//!  Stopped ──initialize──> Initializing ──ready──> Ready ──start──> Rendering
//!     ^                                                           │    ^
//!     │ stop (from anywhere)                           pause      v    │ unpause
//!     │                                          PauseRequired   UnpauseRequired
//!     │                                                │              ^
//!     │                                                v              │
//!     │                                              Paused ──────────┘
//!     │
//!  Muted <── mute (via Stopped)        EndReached / Error: terminal until stop
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ClipState {
    #[default]
    Stopped,
    Initializing,
    Ready,
    Rendering,
    PauseRequired,
    Paused,
    UnpauseRequired,
    EndReached,
    Muted,
    Error,
}

impl ClipState {
    /// Central transition table.
    pub fn can_transition_to(self, next: ClipState) -> bool {
        use ClipState::*;
        if next == Stopped {
            return true;
        }
        match self {
            Stopped => matches!(next, Initializing | Muted),
            Initializing => matches!(next, Ready | Error | EndReached),
            Ready => matches!(next, Rendering | Error | EndReached),
            Rendering => matches!(next, PauseRequired | EndReached | Error),
            PauseRequired => matches!(next, Paused | Rendering | EndReached | Error),
            Paused => matches!(next, UnpauseRequired | EndReached | Error),
            UnpauseRequired => matches!(next, Rendering | Paused | EndReached | Error),
            EndReached | Muted | Error => false,
        }
    }

    /// Decoder is (or is about to be) pushing frames
    pub fn is_rendering(self) -> bool {
        matches!(
            self,
            ClipState::Rendering | ClipState::PauseRequired | ClipState::Paused | ClipState::UnpauseRequired
        )
    }

    /// Clip produces no output in this state
    pub fn is_silent(self) -> bool {
        matches!(self, ClipState::Error | ClipState::Muted | ClipState::EndReached)
    }

    /// States in which the scheduler has nothing to stop
    pub fn is_idle(self) -> bool {
        matches!(self, ClipState::Stopped | ClipState::Muted | ClipState::Error)
    }
}

impl fmt::Display for ClipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
