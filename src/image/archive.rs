//! Loadable image archive layout
//!
//! ```text
//! <layer_id>/layer.tar
//! <layer_id>/VERSION       "1.0"
//! <layer_id>/json          serialized image config
//! repositories             {"<repository>": {"<tag>": "<layer_id>"}}
//! ```

use crate::error::{PublishError, Result};
use crate::image::config::SealedConfig;
use crate::image::layer::LayerInfo;
use crate::output::OutputManager;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LAYER_VERSION: &str = "1.0";

/// `repository -> {tag -> layer id}`; always exactly one repository.
pub type RepositoriesIndex = BTreeMap<String, BTreeMap<String, String>>;

/// Private directory for one scratch assembly.
///
/// Every invocation gets a fresh path; it must be released with
/// [`ScratchWorkspace::remove`] whether or not the assembly succeeded.
#[derive(Debug, Clone)]
pub struct ScratchWorkspace {
    root: PathBuf,
}

impl ScratchWorkspace {
    pub fn create(parent: &Path) -> Result<Self> {
        let root = parent.join(format!("image-publish-{}", Uuid::new_v4()));
        fs::create_dir_all(&root)
            .map_err(|e| PublishError::build("Failed to create scratch directory", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path the collected artifact is written to
    pub fn artifact_path(&self) -> PathBuf {
        self.root.join("artifact.tar")
    }

    /// Staging path of the layer before it is moved under its layer id
    pub fn staging_layer_path(&self) -> PathBuf {
        self.root.join("layer.tar")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image")
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join("image.tar")
    }

    pub fn remove(&self) -> std::io::Result<()> {
        match fs::remove_dir_all(&self.root) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// Assembled archive ready for the engine's load call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageArchive {
    pub layer_id: String,
    pub path: PathBuf,
    pub repositories: RepositoriesIndex,
}

pub struct ArchiveWriter {
    output: OutputManager,
}

impl ArchiveWriter {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }

    /// Lay out the image tree under `image_dir` and tar it into `archive_path`.
    pub fn write(
        &self,
        image_dir: &Path,
        archive_path: &Path,
        layer: &LayerInfo,
        config: &SealedConfig,
        repository: &str,
        tags: &[String],
    ) -> Result<ImageArchive> {
        let layer_id = config.layer_id();
        let layer_dir = image_dir.join(layer_id);
        fs::create_dir_all(&layer_dir)
            .map_err(|e| PublishError::build("Failed to create layer directory", e))?;

        fs::rename(&layer.path, layer_dir.join("layer.tar"))
            .map_err(|e| PublishError::build("Failed to move layer into image", e))?;
        write_synced(&layer_dir.join("VERSION"), LAYER_VERSION.as_bytes())?;
        write_synced(&layer_dir.join("json"), config.json())?;

        let repositories = repositories_index(repository, tags, layer_id);
        let index = serde_json::to_vec(&repositories)?;
        write_synced(&image_dir.join("repositories"), &index)?;

        self.output.detail(&format!(
            "Image tree written for {} ({} tag(s)) at {}",
            repository,
            tags.len(),
            image_dir.display()
        ));

        self.pack(image_dir, layer_id, archive_path)?;

        Ok(ImageArchive {
            layer_id: layer_id.to_string(),
            path: archive_path.to_path_buf(),
            repositories,
        })
    }

    fn pack(&self, image_dir: &Path, layer_id: &str, archive_path: &Path) -> Result<()> {
        let file = File::create(archive_path)
            .map_err(|e| PublishError::build("Failed to create image archive", e))?;
        let mut builder = tar::Builder::new(BufWriter::new(file));
        let layer_dir = image_dir.join(layer_id);

        let pack_err = |e: std::io::Error| PublishError::build("Failed to write image archive", e);
        builder.append_dir(layer_id, &layer_dir).map_err(pack_err)?;
        for name in ["VERSION", "json", "layer.tar"] {
            builder
                .append_path_with_name(layer_dir.join(name), format!("{}/{}", layer_id, name))
                .map_err(pack_err)?;
        }
        builder
            .append_path_with_name(image_dir.join("repositories"), "repositories")
            .map_err(pack_err)?;

        let mut writer = builder.into_inner().map_err(pack_err)?;
        writer.flush().map_err(pack_err)?;

        let size = fs::metadata(archive_path).map(|m| m.len()).unwrap_or(0);
        self.output.detail(&format!(
            "Image archive {} ({})",
            archive_path.display(),
            self.output.format_size(size)
        ));
        Ok(())
    }
}

pub fn repositories_index(repository: &str, tags: &[String], layer_id: &str) -> RepositoriesIndex {
    let tag_map = tags
        .iter()
        .map(|tag| (tag.clone(), layer_id.to_string()))
        .collect();
    let mut index = BTreeMap::new();
    index.insert(repository.to_string(), tag_map);
    index
}

fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| PublishError::build(&format!("Failed to create {}", path.display()), e))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|e| PublishError::build(&format!("Failed to write {}", path.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitOptions;
    use crate::image::config::ImageConfig;
    use std::io::Read;
    use tempfile::TempDir;

    #[test]
    fn test_repositories_index_single_repository() {
        let tags = vec!["latest".to_string(), "main-abc".to_string(), "latest".to_string()];
        let index = repositories_index("quay.io/a/b", &tags, "abc123");
        assert_eq!(index.len(), 1);
        let json = serde_json::to_string(&index).unwrap();
        assert_eq!(json, r#"{"quay.io/a/b":{"latest":"abc123","main-abc":"abc123"}}"#);
    }

    #[test]
    fn test_workspace_paths_are_unique_and_removable() {
        let parent = TempDir::new().unwrap();
        let a = ScratchWorkspace::create(parent.path()).unwrap();
        let b = ScratchWorkspace::create(parent.path()).unwrap();
        assert_ne!(a.root(), b.root());
        assert!(a.archive_path().starts_with(a.root()));

        a.remove().unwrap();
        assert!(!a.root().exists());
        a.remove().unwrap();
    }

    #[test]
    fn test_archive_layout() {
        let parent = TempDir::new().unwrap();
        let workspace = ScratchWorkspace::create(parent.path()).unwrap();
        fs::write(workspace.staging_layer_path(), vec![0u8; 1024]).unwrap();
        let layer = LayerInfo {
            path: workspace.staging_layer_path(),
            diff_id: "sha256:00".to_string(),
            size: 1024,
            entries: 0,
            skipped: 0,
        };
        let sealed = ImageConfig::new(
            &CommitOptions::default(),
            None,
            "linux",
            &layer.diff_id,
            chrono::Utc::now(),
        )
        .seal()
        .unwrap();

        let archive = ArchiveWriter::new(OutputManager::new_quiet())
            .write(
                &workspace.image_dir(),
                &workspace.archive_path(),
                &layer,
                &sealed,
                "reg.example/a/b",
                &["latest".to_string()],
            )
            .unwrap();
        assert_eq!(archive.layer_id, sealed.layer_id());

        let mut names = Vec::new();
        let mut version = String::new();
        let mut tar = tar::Archive::new(File::open(&archive.path).unwrap());
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = crate::image::layer::entry_name(&entry);
            if name.ends_with("/VERSION") {
                entry.read_to_string(&mut version).unwrap();
            }
            names.push(name);
        }

        let id = sealed.layer_id();
        assert_eq!(
            names,
            vec![
                id.to_string(),
                format!("{}/VERSION", id),
                format!("{}/json", id),
                format!("{}/layer.tar", id),
                "repositories".to_string(),
            ]
        );
        assert_eq!(version, "1.0");
        assert!(!layer.path.exists(), "staging layer is moved, not copied");
    }
}
