//! Steps
//!
//! A step is one node of a sequence's control-flow graph. It carries a type,
//! a label, a script, the whitelist of context variables it exchanges with
//! the script environment, a timeout, and some bookkeeping flags.
//!
//! Executing a step prepares a fresh sandboxed script environment, imports
//! the whitelisted variables, runs the step setup script and the step's own
//! script under the interrupt hook, and exports the whitelisted variables
//! back into the context.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use mlua::Value;

use crate::comm::CommChannel;
use crate::context::{Context, VariableName, VariableValue};
use crate::error::{remove_abort_markers, Error};
use crate::message::{send_message, MessageType};
use crate::script::{builtins, HookState, ScriptHost};
use crate::timeout::{Timeout, TimeoutTrigger};

/// The integer type used for indexing steps within a sequence.
pub type StepIndex = u16;

/// Maximum allowed level of indentation (nesting of steps).
pub const MAX_INDENTATION_LEVEL: u16 = 20;

/// Maximum length of a step or sequence label in bytes.
pub const MAX_LABEL_LENGTH: usize = 128;

/// The type of a [`Step`], determining its role in the control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepType {
    /// Run a script, ignoring its (absent) return value
    Action,
    /// Start a conditional block; the script must return a boolean
    If,
    /// Alternative condition within an IF construct
    ElseIf,
    /// Unconditional alternative within an IF construct
    Else,
    /// Close an IF, WHILE, or TRY construct
    End,
    /// Loop while the condition script returns true
    While,
    /// Start a block whose errors are routed to the matching CATCH
    Try,
    /// Start the error handling block of a TRY construct
    Catch,
}

impl StepType {
    /// Return a lower-case name for the step type ("action", "if", "end").
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Action => "action",
            StepType::If => "if",
            StepType::ElseIf => "elseif",
            StepType::Else => "else",
            StepType::End => "end",
            StepType::While => "while",
            StepType::Try => "try",
            StepType::Catch => "catch",
        }
    }

    /// Determine if a step of this type executes a script.
    pub fn executes_script(&self) -> bool {
        matches!(
            self,
            StepType::Action | StepType::If | StepType::ElseIf | StepType::While
        )
    }

    /// Determine if this step type requires a boolean return value from its
    /// script.
    pub fn requires_bool_return_value(&self) -> bool {
        matches!(self, StepType::If | StepType::ElseIf | StepType::While)
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The set of context variable names a step imports and exports.
pub type VariableNames = BTreeSet<VariableName>;

/// One building block of a sequence.
///
/// Steps are exclusively owned by their sequence; callers obtain read-only
/// views and mutate through [`Sequence::modify`](crate::Sequence::modify),
/// which re-establishes the sequence invariants afterwards.
#[derive(Debug, Clone)]
pub struct Step {
    step_type: StepType,
    label: String,
    script: String,
    used_context_variable_names: VariableNames,
    timeout: Timeout,
    indentation_level: u16,
    is_running: bool,
    is_disabled: bool,
    time_of_last_modification: DateTime<Utc>,
    time_of_last_execution: Option<DateTime<Utc>>,
}

impl Step {
    /// Construct a step of the given type with an empty label and script.
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            label: String::new(),
            script: String::new(),
            used_context_variable_names: VariableNames::new(),
            timeout: Timeout::infinite(),
            indentation_level: 0,
            is_running: false,
            is_disabled: false,
            time_of_last_modification: Utc::now(),
            time_of_last_execution: None,
        }
    }

    /// Return the type of this step.
    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    /// Set the type of this step and refresh the modification timestamp.
    pub fn set_type(&mut self, step_type: StepType) {
        self.step_type = step_type;
        self.time_of_last_modification = Utc::now();
    }

    /// Return the label of the step.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the label, trimming surrounding whitespace, and refresh the
    /// modification timestamp.
    pub fn set_label(&mut self, label: &str) -> Result<(), Error> {
        let label = label.trim();
        if label.len() > MAX_LABEL_LENGTH {
            return Err(Error::new(format!(
                "Label \"{label}\" is too long (>{MAX_LABEL_LENGTH} bytes)"
            )));
        }
        self.label = label.to_string();
        self.time_of_last_modification = Utc::now();
        Ok(())
    }

    /// Return the script text.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Set the script that is executed when this step runs and refresh the
    /// modification timestamp. Syntax is not checked here.
    pub fn set_script(&mut self, script: impl Into<String>) {
        self.script = script.into();
        self.time_of_last_modification = Utc::now();
    }

    /// Return the names of the variables that are im-/exported between the
    /// context and the script environment.
    pub fn used_context_variable_names(&self) -> &VariableNames {
        &self.used_context_variable_names
    }

    /// Set the names of the variables that are im-/exported between the
    /// context and the script environment.
    pub fn set_used_context_variable_names(&mut self, names: VariableNames) {
        self.used_context_variable_names = names;
    }

    /// Return the timeout duration for executing the script.
    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    /// Set the timeout duration for executing the script.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout = timeout;
    }

    /// Return the indentation level of this step. Zero indicates a top-level
    /// step; each additional level stands for one level of nesting inside a
    /// block statement such as IF, WHILE, or TRY.
    pub fn indentation_level(&self) -> u16 {
        self.indentation_level
    }

    pub(crate) fn set_indentation_level(&mut self, level: u16) {
        self.indentation_level = level.min(MAX_INDENTATION_LEVEL);
    }

    /// Return whether this step is currently being executed. This flag is
    /// normally mirrored into foreground copies by an executor.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Set whether the step is marked as currently running.
    pub fn set_running(&mut self, is_running: bool) {
        self.is_running = is_running;
    }

    /// Return whether this step is currently disabled.
    pub fn is_disabled(&self) -> bool {
        self.is_disabled
    }

    /// Set whether the step should be skipped during execution and refresh
    /// the modification timestamp.
    pub fn set_disabled(&mut self, disabled: bool) {
        self.is_disabled = disabled;
        self.time_of_last_modification = Utc::now();
    }

    /// Return the timestamp of the last modification of this step.
    pub fn time_of_last_modification(&self) -> DateTime<Utc> {
        self.time_of_last_modification
    }

    /// Return the timestamp of the last execution of this step's script, or
    /// None if it has never been executed.
    pub fn time_of_last_execution(&self) -> Option<DateTime<Utc>> {
        self.time_of_last_execution
    }

    /// Set the timestamp of the last execution. This is normally done by the
    /// engine itself or by an executor mirroring worker state.
    pub fn set_time_of_last_execution(&mut self, time: Option<DateTime<Utc>>) {
        self.time_of_last_execution = time;
    }

    /// Execute the step script within the given context, sending status
    /// information to the communication channel.
    ///
    /// The step reports `step_started` when it begins and `step_stopped` or
    /// `step_stopped_with_error` when it finishes. Condition steps (IF,
    /// ELSEIF, WHILE) return the boolean result of their script; all other
    /// types return false and their script must not return a value.
    ///
    /// Errors keep any abort marker embedded in their message; the sequence
    /// engine relies on it for CATCH routing and the envelope strips it
    /// before anything reaches a caller.
    pub(crate) fn execute(
        &mut self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        step_index: Option<StepIndex>,
        sequence_timeout: Option<&TimeoutTrigger>,
    ) -> Result<bool, Error> {
        let now = Utc::now();
        self.time_of_last_execution = Some(now);
        self.is_running = true;
        send_message(
            MessageType::StepStarted,
            "Step started",
            now,
            step_index,
            context,
            comm,
        );

        let result = self.execute_impl(context, comm, step_index, sequence_timeout);
        self.is_running = false;

        match result {
            Ok(value) => {
                let text = if self.step_type.requires_bool_return_value() {
                    format!("Step finished (logical result: {value})")
                } else {
                    "Step finished".to_string()
                };
                send_message(
                    MessageType::StepStopped,
                    text,
                    Utc::now(),
                    step_index,
                    context,
                    comm,
                );
                Ok(value)
            }
            Err(err) => {
                let (msg, _) = remove_abort_markers(err.message());
                send_message(
                    MessageType::StepStoppedWithError,
                    msg,
                    Utc::now(),
                    step_index,
                    context,
                    comm,
                );
                Err(Error::with_index(err.message(), step_index))
            }
        }
    }

    fn execute_impl(
        &self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        step_index: Option<StepIndex>,
        sequence_timeout: Option<&TimeoutTrigger>,
    ) -> Result<bool, Error> {
        let host = ScriptHost::new()?;
        let hook_state = Arc::new(HookState::new(
            comm,
            self.timeout,
            Instant::now(),
            sequence_timeout,
        ));

        builtins::install_builtins(
            host.lua(),
            &hook_state,
            context.message_callback_function.clone(),
            comm.map(Arc::clone),
            step_index,
        )
        .map_err(|e| Error::new(e.to_string()))?;

        if let Some(setup_function) = &context.step_setup_function {
            setup_function(host.lua()).map_err(|e| Error::new(e.to_string()))?;
        }

        host.install_interrupt_hook(&hook_state);

        if self.step_type.executes_script() && !context.step_setup_script.is_empty() {
            if let Err(msg) = host.run(&context.step_setup_script) {
                return Err(Error::new(format!("[setup] {msg}")));
            }
        }

        self.import_variables(context, &host)?;
        let run_result = host.run(&self.script);
        self.export_variables(context, &host)?;

        let value = run_result.map_err(Error::new)?;

        if self.step_type.requires_bool_return_value() {
            match value {
                Value::Boolean(result) => Ok(result),
                _ => Err(Error::new(format!(
                    "A script in a {} step must return a boolean value (true or false).",
                    self.step_type
                ))),
            }
        } else {
            match value {
                Value::Nil => Ok(false),
                _ => Err(Error::new(format!(
                    "A script in a {} step may not return any value.",
                    self.step_type
                ))),
            }
        }
    }

    /// Copy the whitelisted variables from the context into the script
    /// environment.
    fn import_variables(&self, context: &Context, host: &ScriptHost) -> Result<(), Error> {
        let globals = host.lua().globals();

        for name in &self.used_context_variable_names {
            let Some(value) = context.variables.get(name) else {
                continue;
            };

            let result = match value {
                VariableValue::Integer(i) => globals.set(name.as_str(), *i),
                VariableValue::Float(f) => globals.set(name.as_str(), *f),
                VariableValue::String(s) => globals.set(name.as_str(), s.as_str()),
                VariableValue::Bool(b) => globals.set(name.as_str(), *b),
            };
            result.map_err(|e| Error::new(format!("Cannot import variable {name}: {e}")))?;
        }

        Ok(())
    }

    /// Copy the whitelisted variables from the script environment back into
    /// the context. A nil value deletes the variable; values of types that
    /// have no context representation are ignored.
    fn export_variables(&self, context: &mut Context, host: &ScriptHost) -> Result<(), Error> {
        let globals = host.lua().globals();

        for name in &self.used_context_variable_names {
            let value: Value = globals
                .get::<_, Value>(name.as_str())
                .map_err(|e| Error::new(format!("Cannot export variable {name}: {e}")))?;

            match value {
                Value::Integer(i) => {
                    context.variables.insert(name.clone(), VariableValue::Integer(i));
                }
                Value::Number(n) => {
                    context.variables.insert(name.clone(), VariableValue::Float(n));
                }
                Value::String(s) => {
                    if let Ok(s) = s.to_str() {
                        context
                            .variables
                            .insert(name.clone(), VariableValue::String(s.to_string()));
                    }
                }
                Value::Boolean(b) => {
                    context.variables.insert(name.clone(), VariableValue::Bool(b));
                }
                Value::Nil => {
                    context.variables.shift_remove(name.as_str());
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Default for Step {
    fn default() -> Self {
        Self::new(StepType::Action)
    }
}
