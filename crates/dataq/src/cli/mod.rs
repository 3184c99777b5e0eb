//! CLI command implementations

pub mod cas;
pub mod config;
pub mod context;
pub mod output;
pub mod run;
pub mod tasks;
