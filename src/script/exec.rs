//! Running Script Chunks
//!
//! Compiling and executing script text against a host state, with error
//! message post-processing: every chunk is named with a fixed single-glyph
//! anchor so that the noise Lua adds around the chunk name can be stripped
//! from diagnostics before anyone sees them.

use mlua::{Function, Lua, MultiValue, Value};

/// The fixed chunk name (an anchor glyph) used for all compiled scripts.
pub(crate) const CHUNK_ANCHOR: &str = "\u{2693}";

/// The prefix Lua puts in front of line numbers for chunks named with the
/// anchor glyph.
const CHUNK_PREFIX: &str = "[string \"\u{2693}\"]:";

/// Compile a script without running it.
pub(crate) fn load_script<'lua>(lua: &'lua Lua, script: &str) -> Result<Function<'lua>, String> {
    lua.load(script)
        .set_name(CHUNK_ANCHOR)
        .into_function()
        .map_err(|e| process_error(&e))
}

/// Run a script to completion and return its first return value, or the nil
/// sentinel if the script returns nothing.
///
/// Failures of any kind (syntax errors, runtime errors, errors raised by
/// built-ins or the interrupt hook) are returned as a post-processed message
/// string. The message may contain the abort marker; stripping it is the
/// caller's business.
pub(crate) fn run_script<'lua>(lua: &'lua Lua, script: &str) -> Result<Value<'lua>, String> {
    match lua.load(script).set_name(CHUNK_ANCHOR).eval::<MultiValue>() {
        Ok(values) => Ok(values.into_iter().next().unwrap_or(Value::Nil)),
        Err(e) => Err(process_error(&e)),
    }
}

/// Unwrap callback error chains and strip the chunk-name placeholder.
fn process_error(err: &mlua::Error) -> String {
    let msg = flatten_error(err);
    let msg = msg.replace(CHUNK_PREFIX, "");

    if msg.is_empty() {
        return "Unknown error".to_string();
    }

    msg
}

/// Return the message of the innermost error of a callback error chain.
///
/// Errors raised by built-ins or by the interrupt hook surface as callback
/// errors whose outer layers only describe the trampoline; the message that
/// matters (including a possible abort marker) is in the root cause.
fn flatten_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => flatten_error(cause.as_ref()),
        other => other.to_string(),
    }
}
