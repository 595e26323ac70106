//! Sharebox service support.
//!
//! Configuration loading, logging setup and output formatting shared by the
//! `sharebox` binary. The storage engine itself lives in the `storage` crate.

pub mod config;
pub mod format;
pub mod logging;
