//! Control-Flow Walk
//!
//! The interpreter of the nested control flow over the flat step list.
//! Dispatch per step type:
//! - ACTION: run the script, ignore the boolean result
//! - IF / ELSEIF: run the condition; on true execute the interior block and
//!   jump past the matching END, otherwise skip to the next sibling
//! - ELSE: unconditionally execute the interior block
//! - WHILE: re-evaluate the condition before each pass over the interior
//! - TRY: route errors from the try-block to the catch-block, except for
//!   abort-marker errors, which propagate unconditionally
//! - END: no-op
//!
//! Before every step the walker consults the termination flag of the
//! communication channel, so that cancellation takes effect even between
//! pure control keywords that never enter a script environment.

use std::sync::Arc;

use crate::comm::CommChannel;
use crate::context::Context;
use crate::error::{Error, ABORT_MARKER};
use crate::sequence::syntax::find_end_of_indented_block;
use crate::step::{Step, StepIndex, StepType};
use crate::timeout::TimeoutTrigger;

/// Execute the steps in `[begin, end)`, following the control flow.
pub(crate) fn execute_range(
    steps: &mut [Step],
    begin: usize,
    end: usize,
    context: &mut Context,
    comm: Option<&Arc<CommChannel>>,
    trigger: &TimeoutTrigger,
) -> Result<(), Error> {
    let mut idx = begin;

    while idx < end {
        if steps[idx].is_disabled() {
            idx += 1;
            continue;
        }

        if let Some(comm) = comm {
            if comm.is_termination_requested() {
                return Err(Error::with_index(
                    format!("{ABORT_MARKER}Stop on user request{ABORT_MARKER}"),
                    Some(idx as StepIndex),
                ));
            }
        }

        idx = match steps[idx].step_type() {
            StepType::While => execute_while_block(steps, idx, end, context, comm, trigger)?,
            StepType::Try => execute_try_block(steps, idx, end, context, comm, trigger)?,
            StepType::If | StepType::ElseIf => {
                execute_if_or_elseif_block(steps, idx, end, context, comm, trigger)?
            }
            StepType::Else => execute_else_block(steps, idx, end, context, comm, trigger)?,
            StepType::End => idx + 1,
            StepType::Action => {
                steps[idx].execute(context, comm, Some(idx as StepIndex), Some(trigger))?;
                idx + 1
            }
            StepType::Catch => {
                return Err(Error::with_index(
                    "Unexpected step type",
                    Some(idx as StepIndex),
                ))
            }
        };
    }

    Ok(())
}

/// Execute an IF or ELSEIF block.
///
/// Returns the index of the step to be executed next: past the matching END
/// if the condition evaluated to true, the next sibling otherwise.
fn execute_if_or_elseif_block(
    steps: &mut [Step],
    begin: usize,
    end: usize,
    context: &mut Context,
    comm: Option<&Arc<CommChannel>>,
    trigger: &TimeoutTrigger,
) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let block_end = find_end_of_indented_block(steps, begin + 1, end, level + 1)
        .ok_or_else(|| missing_end(begin, "IF"))?;

    if steps[begin].execute(context, comm, Some(begin as StepIndex), Some(trigger))? {
        execute_range(steps, begin + 1, block_end, context, comm, trigger)?;

        let end_idx = (block_end..end)
            .find(|&i| {
                steps[i].indentation_level() == level
                    && steps[i].step_type() == StepType::End
            })
            .ok_or_else(|| missing_end(begin, "IF"))?;

        return Ok(end_idx + 1);
    }

    Ok(block_end)
}

/// Execute an ELSE block, returning the index of the matching END.
fn execute_else_block(
    steps: &mut [Step],
    begin: usize,
    end: usize,
    context: &mut Context,
    comm: Option<&Arc<CommChannel>>,
    trigger: &TimeoutTrigger,
) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let block_end = find_end_of_indented_block(steps, begin + 1, end, level + 1)
        .ok_or_else(|| missing_end(begin, "ELSE"))?;

    execute_range(steps, begin + 1, block_end, context, comm, trigger)?;

    Ok(block_end)
}

/// Execute a WHILE block, returning the index just past the matching END.
fn execute_while_block(
    steps: &mut [Step],
    begin: usize,
    end: usize,
    context: &mut Context,
    comm: Option<&Arc<CommChannel>>,
    trigger: &TimeoutTrigger,
) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let block_end = find_end_of_indented_block(steps, begin + 1, end, level + 1)
        .ok_or_else(|| missing_end(begin, "WHILE"))?;

    while steps[begin].execute(context, comm, Some(begin as StepIndex), Some(trigger))? {
        execute_range(steps, begin + 1, block_end, context, comm, trigger)?;
    }

    Ok(block_end + 1)
}

/// Execute a TRY block, returning the index of the matching END.
///
/// Errors from the try-block run the catch-block instead of propagating,
/// unless their message carries the abort marker.
fn execute_try_block(
    steps: &mut [Step],
    begin: usize,
    end: usize,
    context: &mut Context,
    comm: Option<&Arc<CommChannel>>,
    trigger: &TimeoutTrigger,
) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let catch_idx = match find_end_of_indented_block(steps, begin + 1, end, level + 1) {
        Some(idx) if steps[idx].step_type() == StepType::Catch => idx,
        _ => {
            return Err(Error::with_index(
                "Missing catch block",
                Some(begin as StepIndex),
            ))
        }
    };

    let catch_block_end = find_end_of_indented_block(steps, catch_idx + 1, end, level + 1)
        .ok_or_else(|| missing_end(begin, "TRY"))?;

    match execute_range(steps, begin + 1, catch_idx, context, comm, trigger) {
        Ok(()) => {}
        Err(err) if err.message().contains(ABORT_MARKER) => return Err(err),
        Err(_) => {
            execute_range(steps, catch_idx + 1, catch_block_end, context, comm, trigger)?;
        }
    }

    Ok(catch_block_end)
}

fn missing_end(begin: usize, construct: &str) -> Error {
    Error::with_index(
        format!("{construct} without matching END"),
        Some(begin as StepIndex),
    )
}
