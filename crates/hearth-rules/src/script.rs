//! Script-facing callable and error types.
//!
//! The script host stores rule conditions, bodies, timer callbacks and
//! process callbacks with the engine as [`Callable`] values. Arguments and
//! results cross the boundary as plain values ([`CallbackArgs`],
//! [`ScriptValue`]); nothing engine-internal leaks into script code.

use std::sync::Arc;

use hearth_core::{CellValue, ScriptValue};
use hearth_model::CellSpec;

use crate::bridge::ScriptCtx;

/// Error raised inside a script callable.
///
/// `IncompleteCell` is the dedicated sentinel for reading a cell that has
/// not yet received a value while the condition guard is active; the
/// condition wrapper converts exactly this error into the skip outcome.
/// Everything else is an ordinary script failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScriptError {
    #[error("cell {0} is not complete")]
    IncompleteCell(CellSpec),

    #[error("{0}")]
    Failure(String),
}

impl ScriptError {
    pub fn failure(msg: impl Into<String>) -> Self {
        ScriptError::Failure(msg.into())
    }
}

/// Result type for script callables.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Arguments delivered to the body of an on-change rule.
#[derive(Debug, Clone)]
pub struct CellChangeEvent {
    pub device: String,
    pub control: String,
    pub new_value: CellValue,
    /// Value observed on the previous firing of the rule; `None` on the
    /// first firing.
    pub old_value: Option<CellValue>,
}

/// Exit report delivered to a process callback.
#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub exit_status: i32,
    /// Captured stdout, present iff stdout capture was requested.
    pub captured_output: Option<String>,
    /// Captured stderr, present iff stderr capture was requested.
    pub captured_error_output: Option<String>,
}

/// Arguments marshalled into a callable invocation.
#[derive(Debug, Clone)]
pub enum CallbackArgs {
    None,
    CellChange(CellChangeEvent),
    ProcessExit(ProcessExit),
}

impl CallbackArgs {
    pub fn cell_change(&self) -> Option<&CellChangeEvent> {
        match self {
            CallbackArgs::CellChange(event) => Some(event),
            _ => None,
        }
    }

    pub fn process_exit(&self) -> Option<&ProcessExit> {
        match self {
            CallbackArgs::ProcessExit(exit) => Some(exit),
            _ => None,
        }
    }
}

/// A script callable stored under an opaque handle.
///
/// Callables only ever run on the engine thread; the `ScriptCtx` they
/// receive is the full primitive surface of the bridge.
pub type Callable =
    Arc<dyn Fn(&mut ScriptCtx<'_>, &CallbackArgs) -> ScriptResult<ScriptValue> + Send + Sync>;

/// Wrap a closure as a [`Callable`].
pub fn callable<F>(f: F) -> Callable
where
    F: Fn(&mut ScriptCtx<'_>, &CallbackArgs) -> ScriptResult<ScriptValue> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a process-exit closure as a [`Callable`]; the exit report is
/// unpacked from the invocation arguments.
pub fn process_callback<F>(f: F) -> Callable
where
    F: Fn(&mut ScriptCtx<'_>, &ProcessExit) -> ScriptResult<()> + Send + Sync + 'static,
{
    Arc::new(move |ctx, args| {
        match args.process_exit() {
            Some(exit) => f(ctx, exit)?,
            None => return Err(ScriptError::failure("process callback invoked without exit report")),
        }
        Ok(ScriptValue::Undefined)
    })
}
