//! Sandbox Construction and Interrupt Hook
//!
//! A [`ScriptHost`] wraps one Lua state with only a whitelisted subset of
//! the standard library loaded. The host is a move-only resource: the
//! wrapped state cannot be cloned, and it is destroyed with the host.
//!
//! The interrupt hook fires after every [`HOOK_INSTRUCTION_COUNT`] script
//! instructions and checks, in order: a pending abort, the termination flag
//! of the communication channel, the step deadline, and the sequence
//! deadline. On any hit it raises a script error whose message is wrapped in
//! the abort marker, which makes it uncatchable by CATCH blocks further up.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Table, Value};

use crate::comm::CommChannel;
use crate::error::{Error, ABORT_MARKER};
use crate::script::exec;
use crate::timeout::{Timeout, TimeoutTrigger};

/// Number of script instructions between two firings of the interrupt hook.
pub const HOOK_INSTRUCTION_COUNT: u32 = 100;

/// Shared state consulted by the interrupt hook and by the `sleep` and
/// `terminate_sequence` built-ins.
///
/// Once an abort has been signalled it is sticky: every subsequent check
/// re-raises the same error, so that a script cannot swallow the abort with
/// a protected call and keep running for more than one hook tick.
pub(crate) struct HookState {
    comm: Option<Arc<CommChannel>>,
    step_deadline: Option<Instant>,
    step_timeout_secs: f64,
    sequence_deadline: Option<Instant>,
    sequence_timeout_secs: f64,
    abort_message: Mutex<Option<String>>,
}

impl HookState {
    pub(crate) fn new(
        comm: Option<&Arc<CommChannel>>,
        step_timeout: Timeout,
        step_start: Instant,
        sequence_timeout: Option<&TimeoutTrigger>,
    ) -> Self {
        let step_deadline = if step_timeout.is_finite() {
            step_start.checked_add(step_timeout.as_duration())
        } else {
            None
        };

        Self {
            comm: comm.map(Arc::clone),
            step_deadline,
            step_timeout_secs: step_timeout.seconds(),
            sequence_deadline: sequence_timeout.and_then(TimeoutTrigger::deadline),
            sequence_timeout_secs: sequence_timeout
                .map_or(f64::INFINITY, |t| t.timeout().seconds()),
            abort_message: Mutex::new(None),
        }
    }

    /// Raise an abort: remember the marker-wrapped message and return it as
    /// a script error.
    pub(crate) fn abort(&self, msg: &str) -> mlua::Error {
        let wrapped = format!("{ABORT_MARKER}{msg}{ABORT_MARKER}");
        *self
            .abort_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(wrapped.clone());
        mlua::Error::RuntimeError(wrapped)
    }

    /// Check for a pending abort, a termination request, and elapsed
    /// deadlines. Called by the interrupt hook and inside `sleep`.
    pub(crate) fn check(&self) -> mlua::Result<()> {
        if let Some(msg) = self
            .abort_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(mlua::Error::RuntimeError(msg));
        }

        if let Some(comm) = &self.comm {
            if comm.is_termination_requested() {
                return Err(self.abort("Stop on user request"));
            }
        }

        let now = Instant::now();

        if let Some(deadline) = self.step_deadline {
            if now > deadline {
                return Err(self.abort(&format!(
                    "Timeout: Script took more than {} s to run",
                    self.step_timeout_secs
                )));
            }
        }

        if let Some(deadline) = self.sequence_deadline {
            if now > deadline {
                return Err(self.abort(&format!(
                    "Timeout: Sequence took more than {} s to run",
                    self.sequence_timeout_secs
                )));
            }
        }

        Ok(())
    }
}

/// An isolated environment for running one script fragment.
///
/// Only a safe subset of the standard library is available to scripts:
/// arithmetic, string, table, and UTF-8 functions plus a restricted time
/// subset of `os`. File I/O, code loading, garbage collector control,
/// debugger access, and the native `print` are removed.
pub struct ScriptHost {
    lua: Lua,
}

impl ScriptHost {
    /// Create a fresh host with the safe library subset loaded.
    pub fn new() -> Result<Self, Error> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8 | StdLib::OS,
            LuaOptions::default(),
        )
        .map_err(|e| Error::new(format!("Cannot create script environment: {e}")))?;

        open_safe_library_subset(&lua)
            .map_err(|e| Error::new(format!("Cannot set up script environment: {e}")))?;

        Ok(Self { lua })
    }

    /// Return the raw handle of the wrapped script environment.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Check a script for syntax errors without running it.
    pub fn compile(&self, script: &str) -> Result<(), Error> {
        exec::load_script(&self.lua, script)
            .map(|_| ())
            .map_err(Error::new)
    }

    /// Run a script to completion, returning its first return value.
    ///
    /// The error string has the chunk-name placeholder stripped; it may
    /// contain the abort marker.
    pub(crate) fn run(&self, script: &str) -> Result<Value<'_>, String> {
        exec::run_script(&self.lua, script)
    }

    /// Install the interrupt hook that checks for termination requests and
    /// elapsed deadlines after every [`HOOK_INSTRUCTION_COUNT`] script
    /// instructions.
    pub(crate) fn install_interrupt_hook(&self, state: &Arc<HookState>) {
        let state = Arc::clone(state);
        let triggers = HookTriggers {
            every_nth_instruction: Some(HOOK_INSTRUCTION_COUNT),
            ..HookTriggers::default()
        };
        self.lua
            .set_hook(triggers, move |_lua, _debug| state.check());
    }
}

/// Remove the hazardous parts of the standard library from the given state
/// and restrict `os` to its time-related functions.
fn open_safe_library_subset(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set("collectgarbage", Value::Nil)?;
    globals.set("debug", Value::Nil)?;
    globals.set("dofile", Value::Nil)?;
    globals.set("load", Value::Nil)?;
    globals.set("loadfile", Value::Nil)?;
    globals.set("print", Value::Nil)?;
    globals.set("require", Value::Nil)?;

    let os_table: Table = globals.get("os")?;
    let restricted_os = lua.create_table()?;
    restricted_os.set("date", os_table.get::<_, Value>("date")?)?;
    restricted_os.set("time", os_table.get::<_, Value>("time")?)?;
    restricted_os.set("difftime", os_table.get::<_, Value>("difftime")?)?;
    globals.set("os", restricted_os)?;

    Ok(())
}
