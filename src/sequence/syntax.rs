//! Syntax Validation
//!
//! A recursive-descent check over the flat step list that verifies the
//! nesting of control-flow constructs:
//! - every IF is followed by zero or more ELSEIF, at most one ELSE, and
//!   exactly one END, all at the IF's level
//! - no ELSEIF appears after an ELSE within the same IF
//! - every WHILE is followed by exactly one END at the same level
//! - every TRY is followed by exactly one CATCH and exactly one END at the
//!   same level
//! - stray ELSEIF, ELSE, CATCH, and END tokens are errors
//!
//! The check relies on the indentation levels assigned by the sequence's
//! invariant pass; blocks are delimited by the first step whose level drops
//! below the block's interior level.

use crate::error::Error;
use crate::step::{Step, StepIndex, StepType};

/// Return the index of the first step in `[begin, end)` whose indentation
/// level is below `min_level`, or None if the whole range is nested deeper.
pub(crate) fn find_end_of_indented_block(
    steps: &[Step],
    begin: usize,
    end: usize,
    min_level: u16,
) -> Option<usize> {
    (begin..end).find(|&idx| steps[idx].indentation_level() < min_level)
}

fn syntax_error<T>(idx: usize, msg: &str) -> Result<T, Error> {
    Err(Error::with_index(
        format!("Syntax error: {msg}"),
        Some(idx as StepIndex),
    ))
}

/// Check a range of steps for syntactic consistency.
pub(crate) fn check_range(steps: &[Step], begin: usize, end: usize) -> Result<(), Error> {
    let mut idx = begin;

    while idx < end {
        match steps[idx].step_type() {
            StepType::While => idx = check_while(steps, idx, end)?,
            StepType::Try => idx = check_try(steps, idx, end)?,
            StepType::If => idx = check_if(steps, idx, end)?,
            StepType::Action => idx += 1,
            StepType::Catch => return syntax_error(idx, "CATCH without matching TRY"),
            StepType::ElseIf => return syntax_error(idx, "ELSE IF without matching IF"),
            StepType::Else => return syntax_error(idx, "ELSE without matching IF"),
            StepType::End => return syntax_error(idx, "END without matching IF/WHILE/TRY"),
        }
    }

    Ok(())
}

/// Check an IF..(ELSEIF)..(ELSE)..END construct, returning the index just
/// past its END.
fn check_if(steps: &[Step], begin: usize, end: usize) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();
    let mut else_found = false;
    let mut block_start = begin;

    loop {
        let Some(idx) = find_end_of_indented_block(steps, block_start + 1, end, level + 1)
        else {
            return syntax_error(begin, "IF without matching END");
        };

        check_range(steps, block_start + 1, idx)?;

        match steps[idx].step_type() {
            StepType::ElseIf => {
                if else_found {
                    return syntax_error(idx, "ELSE IF after ELSE clause");
                }
            }
            StepType::Else => {
                if else_found {
                    return syntax_error(idx, "Duplicate ELSE clause");
                }
                else_found = true;
            }
            StepType::End => return Ok(idx + 1),
            _ => return syntax_error(idx, "Unfinished IF construct"),
        }

        block_start = idx;
    }
}

/// Check a TRY..CATCH..END construct, returning the index just past its END.
fn check_try(steps: &[Step], begin: usize, end: usize) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let catch_idx = match find_end_of_indented_block(steps, begin + 1, end, level + 1) {
        Some(idx) if steps[idx].step_type() == StepType::Catch => idx,
        _ => return syntax_error(begin, "TRY without matching CATCH"),
    };

    check_range(steps, begin + 1, catch_idx)?;

    let end_idx = match find_end_of_indented_block(steps, catch_idx + 1, end, level + 1) {
        Some(idx) if steps[idx].step_type() == StepType::End => idx,
        _ => return syntax_error(begin, "TRY...CATCH without matching END"),
    };

    check_range(steps, catch_idx + 1, end_idx)?;

    Ok(end_idx + 1)
}

/// Check a WHILE..END construct, returning the index just past its END.
fn check_while(steps: &[Step], begin: usize, end: usize) -> Result<usize, Error> {
    let level = steps[begin].indentation_level();

    let block_end = match find_end_of_indented_block(steps, begin + 1, end, level + 1) {
        Some(idx) if steps[idx].step_type() == StepType::End => idx,
        _ => return syntax_error(begin, "WHILE without matching END"),
    };

    check_range(steps, begin + 1, block_end)?;

    Ok(block_end + 1)
}
