//! Keel apply: the differ that turns desired + observed snapshots into an
//! ordered task list, and the executor that carries out one task.

#![forbid(unsafe_code)]

pub mod diff;
pub mod executor;

pub use diff::{actionable, diff, DiffSummary};
pub use executor::{classify, ApplyExecutor};
