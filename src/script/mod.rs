//! Script Host
//!
//! The isolated execution environment for a single script fragment:
//! - host.rs: sandbox construction and the cooperative interrupt hook
//! - exec.rs: compiling and running script chunks, error post-processing
//! - builtins.rs: the custom `print`, `sleep`, and `terminate_sequence`
//!   functions installed into every sandbox

pub mod builtins;
pub mod exec;
pub mod host;

pub use host::ScriptHost;
pub(crate) use host::HookState;
