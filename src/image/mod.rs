//! Scratch image construction
//!
//! Builds a single-layer image from a filesystem tarball and lays it out in the
//! archive format the engine's load primitive accepts.
//!
//! # Overview
//!
//! - [`layer`] rewrites artifact entries into a flat layer and digests it while writing
//! - [`config`] produces the image JSON whose digest becomes the layer id
//! - [`archive`] writes the `{layer_id}/...` tree plus `repositories` and tars it
//! - [`scratch`] ties the three together inside a private [`ScratchWorkspace`]

pub mod archive;
pub mod config;
pub mod digest;
pub mod layer;
pub mod scratch;

pub use archive::{ArchiveWriter, ImageArchive, RepositoriesIndex, ScratchWorkspace};
pub use config::{ImageConfig, SealedConfig};
pub use digest::{DigestUtils, DigestWriter};
pub use layer::{LayerBuilder, LayerInfo};
pub use scratch::{ScratchAssembler, ScratchImage};
