//! Command state machine.
//!
//! ## Transitions
//!
//! ```text
//! IDLE           + operator COMMAND      → COMMANDED
//! COMMANDED      + anything              → PROCESSING   (also applied immediately)
//! PROCESSING     + agent PROGRESS        → PROCESSING
//! PROCESSING     + agent QUESTION        → AWAITING_INPUT
//! PROCESSING     + agent COMPLETION      → COMPLETE
//! PROCESSING     + agent END_OF_WORK     → COMPLETE
//! PROCESSING     + operator COMMAND      → PROCESSING
//! PROCESSING     + operator ANSWER       → PROCESSING
//! AWAITING_INPUT + operator ANSWER       → PROCESSING
//! AWAITING_INPUT + operator COMMAND      → PROCESSING
//! AWAITING_INPUT + agent PROGRESS        → PROCESSING
//! AWAITING_INPUT + agent COMPLETION      → COMPLETE
//! AWAITING_INPUT + agent END_OF_WORK     → COMPLETE
//! ```
//!
//! Every other combination is undefined and reported as
//! [`InvalidTransition`]. COMPLETE is terminal.

use thiserror::Error;

use crate::model::{Actor, CommandState, Intent};

/// The requested combination has no entry in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from} on {actor} {intent}")]
pub struct InvalidTransition {
    pub from: CommandState,
    pub actor: Actor,
    pub intent: Intent,
}

/// Look up the successor state for `(from, actor, intent)`.
pub fn transition(
    from: CommandState,
    actor: Actor,
    intent: Intent,
) -> Result<CommandState, InvalidTransition> {
    use Actor::{Agent, Operator};
    use CommandState::*;

    let to = match (from, actor, intent) {
        (Idle, Operator, Intent::Command) => Some(Commanded),

        (Commanded, _, _) => Some(Processing),

        (Processing, Agent, Intent::Progress) => Some(Processing),
        (Processing, Agent, Intent::Question) => Some(AwaitingInput),
        (Processing, Agent, Intent::Completion | Intent::EndOfWork) => Some(Complete),
        (Processing, Operator, Intent::Command | Intent::Answer) => Some(Processing),

        (AwaitingInput, Operator, Intent::Answer | Intent::Command) => Some(Processing),
        (AwaitingInput, Agent, Intent::Progress) => Some(Processing),
        (AwaitingInput, Agent, Intent::Completion | Intent::EndOfWork) => Some(Complete),

        _ => None,
    };

    to.ok_or(InvalidTransition {
        from,
        actor,
        intent,
    })
}

/// State a command moves to without waiting for any input, if any.
pub fn immediate_successor(state: CommandState) -> Option<CommandState> {
    match state {
        CommandState::Commanded => Some(CommandState::Processing),
        _ => None,
    }
}
