//! taskolib - An embeddable automation engine
//!
//! This library models sequences of steps whose bodies are Lua scripts and
//! executes them either synchronously on the caller's thread or
//! asynchronously on a worker thread, while the caller observes progress
//! through a message stream.
//!
//! A [`Sequence`] is a flat list of [`Step`]s that realizes nested
//! IF / ELSEIF / ELSE / WHILE / TRY-CATCH semantics through step types and
//! derived indentation levels. Each script-executing step runs in a fresh
//! sandboxed [`ScriptHost`] and exchanges typed variables with a
//! caller-supplied [`Context`]. The [`Executor`] moves an execution onto a
//! worker thread and mirrors its progress onto the foreground copy.
//!
//! ```
//! use taskolib::{Context, Sequence, Step, StepType, VariableName, VariableValue};
//!
//! let mut step = Step::new(StepType::Action);
//! step.set_script("a = a + 1");
//! step.set_used_context_variable_names(
//!     [VariableName::new("a").unwrap()].into_iter().collect());
//!
//! let mut sequence = Sequence::new("Count up").unwrap();
//! sequence.push_back(step).unwrap();
//!
//! let mut context = Context::default();
//! context.variables.insert(VariableName::new("a").unwrap(),
//!                          VariableValue::Integer(1));
//!
//! sequence.execute(&mut context, None, None).unwrap();
//! assert_eq!(context.variables.get("a"), Some(&VariableValue::Integer(2)));
//! ```

pub mod comm;
pub mod context;
pub mod error;
pub mod executor;
pub mod message;
pub mod script;
pub mod sequence;
pub mod step;
pub mod timeout;

pub use comm::{CommChannel, LockedQueue, DEFAULT_QUEUE_CAPACITY};
pub use context::{
    Context, MessageCallback, StepSetupFunction, VariableMap, VariableName, VariableValue,
};
pub use error::Error;
pub use executor::Executor;
pub use message::{Message, MessageType};
pub use script::ScriptHost;
pub use sequence::Sequence;
pub use step::{
    Step, StepIndex, StepType, VariableNames, MAX_INDENTATION_LEVEL, MAX_LABEL_LENGTH,
};
pub use timeout::{Timeout, TimeoutTrigger};
