//! Heap diagnostics: per-task accounting, allocation dumps and leak scans.

pub(crate) mod leak;
mod usage;
pub(crate) mod walk;

pub use usage::{AllocTag, Recorder, TaskUsage};
