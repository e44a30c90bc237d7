//! Core types for hearth.
//!
//! This crate defines the foundational types shared across the project:
//! the unified error type and the value variants that travel between the
//! bus, the cell model and rule scripts.

pub mod error;
pub mod value;

pub use error::{Error, Result};
pub use value::{CellValue, ScriptValue};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
