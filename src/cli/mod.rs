//! Command line interface module
//!
//! Parses arguments, turns them into a pipeline context and a publish request, and
//! runs the publisher against the Docker engine.

pub mod args;
pub mod runner;

pub use args::Args;
pub use runner::Runner;
