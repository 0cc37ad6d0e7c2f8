//! Custom Built-ins
//!
//! The three functions installed into every sandbox:
//! - `print(...)` stringifies its arguments and emits an output message
//!   instead of writing to stdout
//! - `sleep(seconds)` pauses in slices of at most 10 ms, observing
//!   termination requests and timeouts between slices
//! - `terminate_sequence()` raises an abort that no CATCH block can
//!   intercept and that stops the sequence without an error

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use mlua::{Function, Lua, Value, Variadic};

use crate::comm::CommChannel;
use crate::context::MessageCallback;
use crate::message::{Message, MessageType};
use crate::script::host::HookState;
use crate::step::StepIndex;

/// Longest uninterruptible slice of a `sleep()` call.
const SLEEP_SLICE_SECONDS: f64 = 0.01;

/// Install `print`, `sleep`, and `terminate_sequence` into the given state.
pub(crate) fn install_builtins(
    lua: &Lua,
    hook_state: &Arc<HookState>,
    message_callback: Option<MessageCallback>,
    comm: Option<Arc<CommChannel>>,
    step_index: Option<StepIndex>,
) -> mlua::Result<()> {
    let globals = lua.globals();

    let print = lua.create_function(move |lua, args: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;

        let mut parts = Vec::with_capacity(args.len());
        for value in args {
            let s: mlua::String = tostring.call(value)?;
            parts.push(s.to_str()?.to_string());
        }

        let msg = Message::new(
            MessageType::Output,
            format!("{}\n", parts.join("\t")),
            Utc::now(),
            step_index,
        );

        if let Some(callback) = &message_callback {
            callback(&msg);
        }
        if let Some(comm) = &comm {
            comm.queue.push(msg);
        }

        Ok(())
    })?;
    globals.set("print", print)?;

    let sleep_state = Arc::clone(hook_state);
    let sleep = lua.create_function(move |_, seconds: f64| {
        let start = Instant::now();
        while start.elapsed().as_secs_f64() < seconds {
            sleep_state.check()?;
            let remaining = seconds - start.elapsed().as_secs_f64();
            thread::sleep(Duration::from_secs_f64(
                remaining.clamp(0.0, SLEEP_SLICE_SECONDS),
            ));
        }
        Ok(())
    })?;
    globals.set("sleep", sleep)?;

    let terminate_state = Arc::clone(hook_state);
    let terminate = lua.create_function(move |_, ()| -> mlua::Result<()> {
        Err(terminate_state.abort(""))
    })?;
    globals.set("terminate_sequence", terminate)?;

    Ok(())
}
