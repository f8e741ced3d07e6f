//! What a caller gets back from a coalesced call.

use std::any::Any;
use std::fmt;
use std::panic;

/// How a caller took part in a flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// This caller executed the work function.
    Owner,
    /// This caller reused the result of another caller's execution.
    Joiner,
}

/// Result of a coalesced call together with how it was obtained.
#[derive(Debug, Clone)]
pub struct Execution<V, E> {
    /// The work function's result, identical for every caller of the flight.
    pub result: Result<V, E>,
    /// Whether this caller ran the work or joined it.
    pub role: Role,
    /// Whether the result was handed to more than one caller.
    pub shared: bool,
}

impl<V, E> Execution<V, E> {
    pub(crate) fn owned(result: Result<V, E>, joiners: usize) -> Self {
        Self {
            result,
            role: Role::Owner,
            shared: joiners > 0,
        }
    }

    pub(crate) fn joined(result: Result<V, E>) -> Self {
        Self {
            result,
            role: Role::Joiner,
            shared: true,
        }
    }

    /// True if this caller executed the work function.
    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// Discard the role information.
    pub fn into_result(self) -> Result<V, E> {
        self.result
    }
}

/// Panic payload raised in joiners when the owner's work function panicked.
///
/// The owner itself re-raises the original payload; joiners receive this
/// instead since panic payloads cannot be cloned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Panicked {
    /// Name of the coalescer the flight ran on.
    pub coalescer: String,
    /// Panic message of the work function, when it was a string.
    pub message: String,
}

impl Panicked {
    pub(crate) fn from_payload(coalescer: &str, payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };
        Self {
            coalescer: coalescer.to_string(),
            message,
        }
    }
}

impl fmt::Display for Panicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "coalesced work on '{}' panicked: {}", self.coalescer, self.message)
    }
}

/// Outcome recorded on a flight and fanned out to joiners.
#[derive(Debug, Clone)]
pub(crate) enum Outcome<V, E> {
    Returned(Result<V, E>),
    Panicked(Panicked),
}

impl<V, E> Outcome<V, E> {
    /// Unpack the outcome for a joiner, re-raising a recorded panic.
    pub(crate) fn into_joined(self) -> Execution<V, E> {
        match self {
            Outcome::Returned(result) => Execution::joined(result),
            Outcome::Panicked(panicked) => panic::panic_any(panicked),
        }
    }
}
