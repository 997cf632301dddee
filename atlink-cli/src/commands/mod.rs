//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod check;
pub(crate) mod completions;
pub(crate) mod run;
