//! Single-layer image assembly without the engine's commit machinery

use crate::config::{CommitOptions, ContainerHandle};
use crate::error::Result;
use crate::image::archive::{ArchiveWriter, ImageArchive, ScratchWorkspace};
use crate::image::config::ImageConfig;
use crate::image::digest::DigestUtils;
use crate::image::layer::LayerBuilder;
use crate::output::OutputManager;
use chrono::Utc;
use std::path::Path;

/// Image metadata for one scratch assembly
#[derive(Debug, Clone, Copy)]
pub struct ScratchImage<'a> {
    pub commit: &'a CommitOptions,
    pub container: Option<&'a ContainerHandle>,
    pub os: &'a str,
    pub repository: &'a str,
    pub tags: &'a [String],
}

pub struct ScratchAssembler {
    output: OutputManager,
}

impl ScratchAssembler {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }

    /// Turn `artifact` into a loadable archive inside `workspace`.
    ///
    /// The workspace is left in place; the caller owns its removal.
    pub fn assemble(
        &self,
        workspace: &ScratchWorkspace,
        artifact: &Path,
        image: &ScratchImage<'_>,
    ) -> Result<ImageArchive> {
        self.output.subsection("Assembling scratch image");

        let layer = LayerBuilder::new(self.output.clone())
            .build(artifact, &workspace.staging_layer_path())?;

        let config = ImageConfig::new(
            image.commit,
            image.container,
            image.os,
            &layer.diff_id,
            Utc::now(),
        )
        .seal()?;
        self.output.fields(
            "Image config sealed",
            &[
                ("layer_id", DigestUtils::format_digest_short(config.layer_id())),
                ("diff_id", DigestUtils::format_digest_short(&layer.diff_id)),
                ("bytes", config.json().len().to_string()),
            ],
        );

        let archive = ArchiveWriter::new(self.output.clone()).write(
            &workspace.image_dir(),
            &workspace.archive_path(),
            &layer,
            &config,
            image.repository,
            image.tags,
        )?;

        self.output.success(&format!(
            "Scratch image {} assembled",
            DigestUtils::format_digest_short(&archive.layer_id)
        ));
        Ok(archive)
    }
}
