//! Core conversation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions.

mod effect;
pub mod event;
pub mod session;
pub mod stack;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::Event;
pub use session::UserSession;
pub use state::{ConvContext, ConvState};
pub use transition::{prompt_for, transition, TransitionError};
