//! Error Types
//!
//! The public [`Error`] type returned by every fallible operation of the
//! crate, plus the internal abort-marker machinery:
//! - the abort marker, a sentinel embedded in error messages to mark them
//!   as non-catchable by TRY/CATCH blocks
//! - classification of an error message into an [`ErrorCause`]
//! - cosmetic cleanup of Lua stack tracebacks

use thiserror::Error as ThisError;

use crate::step::StepIndex;

/// A marker string (the word "ABORT" surrounded by Unicode stop signs) whose
/// presence anywhere in an error message signals that the execution of a
/// script must stop and that no CATCH block may intercept the error.
pub(crate) const ABORT_MARKER: &str = "\u{1F6D1}ABORT\u{1F6D1}";

/// The error type used by all public operations of this crate.
///
/// An `Error` carries a message and, where the failure can be attributed to a
/// specific step of a sequence, the index of that step.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{message}")]
pub struct Error {
    message: String,
    step_index: Option<StepIndex>,
}

impl Error {
    /// Create an error that is not attributed to any specific step.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), step_index: None }
    }

    /// Create an error attributed to the step with the given index.
    pub fn with_index(message: impl Into<String>, step_index: Option<StepIndex>) -> Self {
        Self { message: message.into(), step_index }
    }

    /// Return the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Return the index of the step this error is attributed to, if any.
    pub fn step_index(&self) -> Option<StepIndex> {
        self.step_index
    }
}

/// The possible causes for the premature termination of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCause {
    /// The script called `terminate_sequence()`.
    TerminatedByScript,
    /// The execution was aborted by a termination request or a timeout.
    Aborted,
    /// Any other error that was not caught by a CATCH block.
    UncaughtError,
}

/// Set a Lua stack traceback apart from the main message with a bullet point.
pub(crate) fn beautify_message(msg: &str) -> String {
    msg.replace("\nstack traceback:\n", "\n\u{25CF} Stack traceback:\n")
}

/// Remove abort markers from the given error message and determine the cause
/// of the error.
///
/// If at least two markers are present, the message is truncated to the text
/// between the first two of them; otherwise all markers are removed. A
/// message without markers describes an ordinary error
/// ([`ErrorCause::UncaughtError`]). A message with markers describes an abort
/// request: a non-empty text means a user or timeout abort
/// ([`ErrorCause::Aborted`]), an empty text means the script itself asked to
/// terminate, and the message is replaced by a fixed explanation
/// ([`ErrorCause::TerminatedByScript`]).
pub(crate) fn remove_abort_markers(error_message: &str) -> (String, ErrorCause) {
    let tokens: Vec<&str> = error_message.split(ABORT_MARKER).collect();

    let msg = match tokens.len() {
        0 | 1 => return (beautify_message(error_message), ErrorCause::UncaughtError),
        2 => beautify_message(&format!("{}{}", tokens[0], tokens[1])),
        // The real error message is between the first two abort markers.
        _ => beautify_message(tokens[1]),
    };

    if msg.is_empty() {
        return (
            "Script called terminate_sequence()".to_string(),
            ErrorCause::TerminatedByScript,
        );
    }

    (msg, ErrorCause::Aborted)
}
