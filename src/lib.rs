//! Image Publisher Library
//!
//! Commits a pipeline container (or assembles a single-layer image from an artifact
//! tarball), tags it and pushes it to a registry, inferring the registry and
//! repository from partial configuration.

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod image;
pub mod output;
pub mod publish;
pub mod registry;

pub use config::{PipelineContext, PublishRequest, PublishRequestBuilder};
pub use error::{PublishError, Result};
pub use output::OutputManager;
pub use publish::{PublishReport, Publisher};
