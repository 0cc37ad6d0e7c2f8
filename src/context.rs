//! Execution Context
//!
//! The per-execution state handed to the engine:
//! - [`VariableName`]: a validated identifier used as variable key
//! - [`VariableValue`]: the closed set of types that can cross the script
//!   boundary
//! - [`Context`]: the typed variable map plus optional callbacks

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex_lite::Regex;

use crate::error::Error;
use crate::message::Message;

lazy_static! {
    static ref IDENTIFIER_RE: Regex = Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").unwrap();
}

/// Maximum length of a variable name in bytes.
pub const MAX_VARIABLE_NAME_LENGTH: usize = 64;

/// The name of a context variable.
///
/// Variable names are shared between the context and the script environment,
/// so they must follow the scripting language's identifier grammar: a letter
/// or underscore followed by letters, digits, or underscores, at most 64
/// bytes in total.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariableName(String);

impl VariableName {
    /// Create a variable name, validating it against the identifier grammar.
    pub fn new(name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();

        if name.len() > MAX_VARIABLE_NAME_LENGTH {
            return Err(Error::new(format!(
                "Variable name \"{name}\" is too long (>{MAX_VARIABLE_NAME_LENGTH} bytes)"
            )));
        }
        if !IDENTIFIER_RE.is_match(&name) {
            return Err(Error::new(format!(
                "Variable name \"{name}\" is not a valid identifier"
            )));
        }

        Ok(Self(name))
    }

    /// Return the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for VariableName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for VariableName {
    type Error = Error;

    fn try_from(name: &str) -> Result<Self, Error> {
        Self::new(name)
    }
}

/// A value that can be passed between the context and a script environment.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit IEEE floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Boolean
    Bool(bool),
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// The variable map of a context, in insertion order.
pub type VariableMap = indexmap::IndexMap<VariableName, VariableValue>;

/// A function that is called once per step, before the step setup script,
/// with the raw script environment. Collaborators use it to inject custom
/// built-ins into the sandbox.
pub type StepSetupFunction = Arc<dyn Fn(&mlua::Lua) -> mlua::Result<()> + Send + Sync>;

/// A function that is called for every message produced by an execution.
pub type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// A context for executing a step or sequence.
///
/// The context carries the typed variables that are imported into and
/// exported from step scripts, plus two optional callbacks. The
/// `step_setup_script` member is overwritten with the step setup script of
/// the executed sequence at execution start.
#[derive(Clone, Default)]
pub struct Context {
    /// Variables that can be im-/exported into/from steps
    pub variables: VariableMap,
    /// Step setup script, copied in from the sequence at execution start
    pub step_setup_script: String,
    /// Called once per step with the raw script environment, before the
    /// step setup script runs
    pub step_setup_function: Option<StepSetupFunction>,
    /// Called for every message; on the foreground thread this happens
    /// during `Executor::update()`
    pub message_callback_function: Option<MessageCallback>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("variables", &self.variables)
            .field("step_setup_script", &self.step_setup_script)
            .field("step_setup_function", &self.step_setup_function.as_ref().map(|_| ".."))
            .field(
                "message_callback_function",
                &self.message_callback_function.as_ref().map(|_| ".."),
            )
            .finish()
    }
}
