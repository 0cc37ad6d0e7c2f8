//! Messages
//!
//! Status messages produced by a running sequence. Messages are the only
//! mechanism for observing progress: they are pushed into the communication
//! channel by the worker and drained by the foreground.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::comm::CommChannel;
use crate::context::Context;
use crate::step::StepIndex;

/// The type of a [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Output from a `print()` call in a script
    Output,
    /// A sequence (or single-step execution) has started
    SequenceStarted,
    /// A sequence has finished normally
    SequenceStopped,
    /// A sequence has stopped because of an error
    SequenceStoppedWithError,
    /// A step has started
    StepStarted,
    /// A step has finished normally
    StepStopped,
    /// A step has stopped because of an error
    StepStoppedWithError,
}

/// A message carrying status information about a running sequence.
#[derive(Debug, Clone)]
pub struct Message {
    message_type: MessageType,
    text: String,
    timestamp: DateTime<Utc>,
    step_index: Option<StepIndex>,
}

impl Message {
    /// Create a message.
    pub fn new(
        message_type: MessageType,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        step_index: Option<StepIndex>,
    ) -> Self {
        Self { message_type, text: text.into(), timestamp, step_index }
    }

    /// Return the message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Return the text payload.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Return the wall-clock timestamp of the message.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Return the index of the step this message refers to, if any.
    pub fn step_index(&self) -> Option<StepIndex> {
        self.step_index
    }
}

/// Invoke the context's message callback and enqueue the message in the
/// given communication channel, if any.
pub(crate) fn send_message(
    message_type: MessageType,
    text: impl Into<String>,
    timestamp: DateTime<Utc>,
    step_index: Option<StepIndex>,
    context: &Context,
    comm_channel: Option<&Arc<CommChannel>>,
) {
    let msg = Message::new(message_type, text, timestamp, step_index);

    if let Some(callback) = &context.message_callback_function {
        callback(&msg);
    }

    if let Some(comm) = comm_channel {
        comm.queue.push(msg);
    }
}
