//! Sequences
//!
//! A sequence owns an ordered, flat list of steps plus metadata and upholds
//! the structural invariants of that list:
//! - the indentation level of every step equals its static nesting depth;
//!   ill-formed nesting stores an error string and clamps the levels
//! - a compound construct (IF..END, WHILE..END, TRY..CATCH..END) is atomic
//!   for enable/disable
//!
//! Steps are mutated exclusively through the sequence's own API so that the
//! invariants can be re-established after every change. Execution walks the
//! nested control flow over the flat list (execute.rs) after validating it
//! (syntax.rs).

mod execute;
mod syntax;

use std::ops::Index;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::comm::CommChannel;
use crate::context::Context;
use crate::error::{remove_abort_markers, Error, ErrorCause};
use crate::message::{send_message, MessageType};
use crate::step::{Step, StepIndex, StepType, MAX_LABEL_LENGTH};
use crate::timeout::{Timeout, TimeoutTrigger};

/// A sequence of steps to be executed under a given context.
///
/// ```
/// use taskolib::{Sequence, Step, StepType};
///
/// let mut sequence = Sequence::new("Check temperature").unwrap();
/// sequence.push_back(Step::new(StepType::Try)).unwrap();
/// sequence.push_back(Step::new(StepType::Action)).unwrap();
/// sequence.push_back(Step::new(StepType::Catch)).unwrap();
/// sequence.push_back(Step::new(StepType::Action)).unwrap();
/// sequence.push_back(Step::new(StepType::End)).unwrap();
/// assert_eq!(sequence[1].indentation_level(), 1);
/// ```
///
/// ## Step setup script
///
/// A sequence can carry a setup script that is shared by all of its steps.
/// It runs automatically before the script of each step, just after the
/// step setup function from the context. It is typically used as a small
/// library of common functions or constants. The setup script only runs for
/// step types that execute a script (ACTION, IF, ELSEIF, WHILE).
///
/// ## Sequence timeout
///
/// The sequence timeout is infinite by default and is measured from the
/// start of each execution.
#[derive(Debug, Clone)]
pub struct Sequence {
    label: String,
    step_setup_script: String,
    steps: Vec<Step>,
    indentation_error: Option<String>,
    error: Option<Error>,
    is_running: bool,
    timeout_trigger: TimeoutTrigger,
    time_of_last_execution: Option<DateTime<Utc>>,
}

impl Sequence {
    /// Construct an empty sequence with a descriptive label.
    ///
    /// Surrounding whitespace is trimmed; the remaining label must be
    /// non-empty and at most 128 bytes long.
    pub fn new(label: &str) -> Result<Self, Error> {
        let mut sequence = Self {
            label: String::new(),
            step_setup_script: String::new(),
            steps: Vec::new(),
            indentation_error: None,
            error: None,
            is_running: false,
            timeout_trigger: TimeoutTrigger::new(),
            time_of_last_execution: None,
        };
        sequence.set_label(label)?;
        Ok(sequence)
    }

    /// Return the maximum number of steps a sequence can hold.
    pub fn max_size() -> usize {
        StepIndex::MAX as usize
    }

    /// Return the sequence label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Set the sequence label. Surrounding whitespace is trimmed; the
    /// remaining label must be non-empty and at most 128 bytes long.
    pub fn set_label(&mut self, label: &str) -> Result<(), Error> {
        let label = label.trim();

        if label.is_empty() {
            return Err(Error::new("Sequence label may not be empty"));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(Error::new(format!(
                "Label \"{label}\" is too long (>{MAX_LABEL_LENGTH} bytes)"
            )));
        }

        self.label = label.to_string();
        Ok(())
    }

    /// Return the step setup script.
    pub fn step_setup_script(&self) -> &str {
        &self.step_setup_script
    }

    /// Set the step setup script that runs before the script of each
    /// individual step. Trailing whitespace is removed.
    pub fn set_step_setup_script(&mut self, script: &str) -> Result<(), Error> {
        self.throw_if_running()?;
        self.step_setup_script = script.trim_end().to_string();
        Ok(())
    }

    /// Return the timeout duration for executing the sequence.
    pub fn timeout(&self) -> Timeout {
        self.timeout_trigger.timeout()
    }

    /// Set the timeout duration for executing the sequence.
    pub fn set_timeout(&mut self, timeout: Timeout) {
        self.timeout_trigger.set_timeout(timeout);
    }

    /// Return true if the sequence timeout has elapsed since the last
    /// execution started.
    pub fn is_timeout_elapsed(&self) -> bool {
        self.timeout_trigger.is_elapsed()
    }

    /// Return the wall-clock time at which the last execution started, or
    /// None if the sequence was never executed.
    pub fn time_of_last_execution(&self) -> Option<DateTime<Utc>> {
        self.time_of_last_execution
    }

    /// Return whether the sequence is currently being executed.
    pub fn is_running(&self) -> bool {
        self.is_running
    }

    /// Set the "is running" state. This is normally only done by an
    /// executor mirroring worker state, or by tests.
    pub fn set_running(&mut self, running: bool) {
        self.is_running = running;
    }

    /// Return the error that stopped the last execution prematurely, or
    /// None if it finished normally.
    pub fn last_error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Set or clear the stored execution error. This is normally only done
    /// by an executor mirroring worker state, or by tests.
    pub fn set_error(&mut self, error: Option<Error>) {
        self.error = error;
    }

    /// Return an error string if the steps are not consistently nested, or
    /// None if the nesting is correct.
    pub fn indentation_error(&self) -> Option<&str> {
        self.indentation_error.as_deref()
    }

    /// Return the number of steps in the sequence.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Determine whether the sequence contains no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Return a read-only view of the step at the given index.
    pub fn get(&self, idx: usize) -> Option<&Step> {
        self.steps.get(idx)
    }

    /// Return a read-only iterator over the steps.
    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// Return a read-only view of all steps.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Add a step to the end of the sequence.
    pub fn push_back(&mut self, step: Step) -> Result<(), Error> {
        self.throw_if_running()?;
        self.throw_if_full()?;
        self.steps.push(step);
        self.enforce_invariants();
        Ok(())
    }

    /// Remove the last step from the sequence. Calling this on an empty
    /// sequence returns silently.
    pub fn pop_back(&mut self) -> Result<(), Error> {
        self.throw_if_running()?;
        self.steps.pop();
        self.enforce_invariants();
        Ok(())
    }

    /// Insert a step just before the given index.
    pub fn insert(&mut self, idx: usize, step: Step) -> Result<(), Error> {
        self.throw_if_running()?;
        self.throw_if_full()?;
        if idx > self.steps.len() {
            return Err(Error::new(format!("Invalid step index {idx}")));
        }
        self.steps.insert(idx, step);
        self.enforce_invariants();
        Ok(())
    }

    /// Replace the step at the given index.
    pub fn assign(&mut self, idx: usize, step: Step) -> Result<(), Error> {
        self.throw_if_running()?;
        let slot = self
            .steps
            .get_mut(idx)
            .ok_or_else(|| Error::new(format!("Invalid step index {idx}")))?;
        *slot = step;
        self.enforce_invariants();
        Ok(())
    }

    /// Remove the step at the given index.
    pub fn erase(&mut self, idx: usize) -> Result<(), Error> {
        self.throw_if_running()?;
        if idx >= self.steps.len() {
            return Err(Error::new(format!("Invalid step index {idx}")));
        }
        self.steps.remove(idx);
        self.enforce_invariants();
        Ok(())
    }

    /// Remove a range of steps. The range includes its start index and
    /// excludes its end index.
    pub fn erase_range(&mut self, range: std::ops::Range<usize>) -> Result<(), Error> {
        self.throw_if_running()?;
        if range.start > range.end || range.end > self.steps.len() {
            return Err(Error::new(format!(
                "Invalid step range {}..{}",
                range.start, range.end
            )));
        }
        self.steps.drain(range);
        self.enforce_invariants();
        Ok(())
    }

    /// Modify the step at the given index in place.
    ///
    /// The modification is done by a user-supplied closure that receives a
    /// mutable reference to the step. A sequence never hands out mutable
    /// step references directly because it has to uphold its invariants;
    /// after the closure returns, indentation and disabled flags are
    /// re-established as needed.
    ///
    /// Re-enabling the head of a compound construct re-enables the entire
    /// construct.
    pub fn modify<F>(&mut self, idx: usize, modification: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Step),
    {
        self.throw_if_running()?;

        let step = self
            .steps
            .get_mut(idx)
            .ok_or_else(|| Error::new(format!("Invalid step index {idx}")))?;

        let old_type = step.step_type();
        let old_level = step.indentation_level();
        let old_disabled = step.is_disabled();

        modification(step);

        if self.steps[idx].step_type() != old_type
            || self.steps[idx].indentation_level() != old_level
        {
            self.indent();
        }

        if old_disabled && !self.steps[idx].is_disabled() {
            if matches!(
                self.steps[idx].step_type(),
                StepType::If | StepType::While | StepType::Try
            ) {
                let block_end = self.find_end_of_continuation(idx);
                for step in &mut self.steps[idx..block_end] {
                    if step.is_disabled() {
                        step.set_disabled(false);
                    }
                }
            }
        }

        self.enforce_consistency_of_disabled_flags();
        Ok(())
    }

    /// Validate that the step types form properly nested constructs.
    ///
    /// Each TRY must have a corresponding CATCH and END; each IF may have
    /// any number of ELSEIF steps and at most one ELSE before its END; each
    /// WHILE must have a matching END. An ill-formed sequence yields an
    /// error naming the offending step.
    pub fn check_syntax(&self) -> Result<(), Error> {
        if let Some(msg) = &self.indentation_error {
            return Err(Error::new(msg.clone()));
        }
        syntax::check_range(&self.steps, 0, self.steps.len())
    }

    /// Execute the sequence, or a single one of its steps, within the given
    /// context.
    ///
    /// With `opt_step_index == None`, the function validates the syntax,
    /// resets the sequence timeout, and walks the step list following the
    /// control flow; disabled steps are skipped. With a step index, exactly
    /// that step is executed (if it is of a script-executing type), without
    /// any structure validation.
    ///
    /// Messages for the starting and stopping of steps and of the sequence
    /// itself are sent through the communication channel, if one is given,
    /// and termination requests arriving through it are honored.
    ///
    /// The outcome is also stored on the sequence and can be retrieved with
    /// [`last_error()`](Self::last_error). A script calling
    /// `terminate_sequence()` stops the sequence without an error.
    pub fn execute(
        &mut self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        opt_step_index: Option<StepIndex>,
    ) -> Result<(), Error> {
        let exec_block_name = match opt_step_index {
            Some(idx) => {
                let step = self
                    .steps
                    .get(idx as usize)
                    .ok_or_else(|| Error::new(format!("Invalid step index {idx}")))?;
                format!(
                    "Single-step execution ({} \"{}\")",
                    step.step_type(),
                    step.label()
                )
            }
            None => "Sequence".to_string(),
        };

        debug!(label = %self.label, "{} starting", exec_block_name);

        self.is_running = true;
        self.time_of_last_execution = Some(Utc::now());
        context.step_setup_script = self.step_setup_script.clone();

        send_message(
            MessageType::SequenceStarted,
            format!("{exec_block_name} started"),
            Utc::now(),
            None,
            context,
            comm,
        );

        let run_result: Result<(), Error> = match opt_step_index {
            Some(idx) => {
                if self.steps[idx as usize].step_type().executes_script() {
                    self.steps[idx as usize]
                        .execute(context, comm, Some(idx), Some(&self.timeout_trigger))
                        .map(|_| ())
                } else {
                    Ok(())
                }
            }
            None => {
                let num_steps = self.steps.len();
                self.check_syntax().and_then(|()| {
                    self.timeout_trigger.reset();
                    execute::execute_range(
                        &mut self.steps,
                        0,
                        num_steps,
                        context,
                        comm,
                        &self.timeout_trigger,
                    )
                })
            }
        };

        let outcome = match run_result {
            Ok(()) => {
                send_message(
                    MessageType::SequenceStopped,
                    format!("{exec_block_name} finished"),
                    Utc::now(),
                    None,
                    context,
                    comm,
                );
                Ok(())
            }
            Err(err) => {
                let (msg, cause) = remove_abort_markers(err.message());
                match cause {
                    ErrorCause::TerminatedByScript => {
                        send_message(
                            MessageType::SequenceStopped,
                            msg,
                            Utc::now(),
                            err.step_index(),
                            context,
                            comm,
                        );
                        Ok(())
                    }
                    ErrorCause::Aborted => {
                        let err = Error::with_index(
                            format!("{exec_block_name} aborted: {msg}"),
                            err.step_index(),
                        );
                        send_message(
                            MessageType::SequenceStoppedWithError,
                            err.message(),
                            Utc::now(),
                            err.step_index(),
                            context,
                            comm,
                        );
                        Err(err)
                    }
                    ErrorCause::UncaughtError => {
                        let err = Error::with_index(
                            format!("{exec_block_name} stopped with error: {msg}"),
                            err.step_index(),
                        );
                        send_message(
                            MessageType::SequenceStoppedWithError,
                            err.message(),
                            Utc::now(),
                            err.step_index(),
                            context,
                            comm,
                        );
                        Err(err)
                    }
                }
            }
        };

        self.error = outcome.as_ref().err().cloned();
        self.is_running = false;
        outcome
    }

    /// Re-establish all class invariants after a mutation.
    fn enforce_invariants(&mut self) {
        self.indent();
        self.enforce_consistency_of_disabled_flags();
    }

    /// Assign indentation levels to all steps according to their logical
    /// nesting.
    ///
    /// If errors in the nesting are found, an approximate indentation is
    /// assigned and `indentation_error` is filled with a message; otherwise
    /// it is cleared.
    fn indent(&mut self) {
        let mut level: i32 = 0;
        self.indentation_error = None;

        for step in &mut self.steps {
            let step_level = match step.step_type() {
                StepType::Action => level,
                StepType::If | StepType::Try | StepType::While => {
                    let assigned = level;
                    level += 1;
                    assigned
                }
                StepType::Catch | StepType::Else | StepType::ElseIf => level - 1,
                StepType::End => {
                    level -= 1;
                    level
                }
            };

            let step_level = if step_level < 0 {
                if self.indentation_error.is_none() {
                    self.indentation_error = Some("Steps are not nested correctly".to_string());
                }
                0
            } else {
                step_level
            };

            step.set_indentation_level(step_level as u16);

            if level < 0 {
                level = 0;
                if self.indentation_error.is_none() {
                    self.indentation_error = Some(
                        "Steps are not nested correctly (every END must correspond to one \
                         IF, TRY, or WHILE)"
                            .to_string(),
                    );
                }
            } else if level > i32::from(crate::step::MAX_INDENTATION_LEVEL) {
                level = i32::from(crate::step::MAX_INDENTATION_LEVEL);
                if self.indentation_error.is_none() {
                    self.indentation_error = Some(format!(
                        "Steps are nested too deeply (max. level: {})",
                        crate::step::MAX_INDENTATION_LEVEL
                    ));
                }
            }
        }

        if level != 0 && self.indentation_error.is_none() {
            self.indentation_error = Some(
                "Steps are not nested correctly (there must be one END for each IF, TRY, \
                 WHILE)"
                    .to_string(),
            );
        }
    }

    /// Update the disabled flags of all steps so that compound constructs
    /// are never partially disabled.
    ///
    /// A disabled IF/WHILE/TRY head disables its entire construct; an
    /// enabled head re-enables the associated control keywords (ELSE,
    /// ELSEIF, CATCH, END) at its level, leaving interior steps untouched.
    fn enforce_consistency_of_disabled_flags(&mut self) {
        let mut idx = 0;

        while idx < self.steps.len() {
            match self.steps[idx].step_type() {
                StepType::If | StepType::Try | StepType::While => {
                    let level = self.steps[idx].indentation_level();
                    let block_end = self.find_end_of_continuation(idx);

                    if self.steps[idx].is_disabled() {
                        for step in &mut self.steps[idx..block_end] {
                            if !step.is_disabled() {
                                step.set_disabled(true);
                            }
                        }
                        idx = block_end;
                    } else {
                        for step in &mut self.steps[idx..block_end] {
                            if step.indentation_level() == level && step.is_disabled() {
                                step.set_disabled(false);
                            }
                        }
                        idx += 1;
                    }
                }
                _ => idx += 1,
            }
        }
    }

    /// Return the index just past the END step that closes the compound
    /// construct starting at `block_start`, or the number of steps if there
    /// is no matching END.
    fn find_end_of_continuation(&self, block_start: usize) -> usize {
        let level = self.steps[block_start].indentation_level();

        (block_start..self.steps.len())
            .find(|&i| {
                self.steps[i].indentation_level() == level
                    && self.steps[i].step_type() == StepType::End
            })
            .map_or(self.steps.len(), |i| i + 1)
    }

    fn throw_if_running(&self) -> Result<(), Error> {
        if self.is_running {
            return Err(Error::new("Cannot change a running sequence"));
        }
        Ok(())
    }

    fn throw_if_full(&self) -> Result<(), Error> {
        if self.steps.len() >= Self::max_size() {
            return Err(Error::new(format!(
                "Reached maximum sequence size ({} steps)",
                Self::max_size()
            )));
        }
        Ok(())
    }
}

impl Index<usize> for Sequence {
    type Output = Step;

    fn index(&self, idx: usize) -> &Step {
        &self.steps[idx]
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}
