//! Layer construction from collected artifact tarballs
//!
//! Artifacts are collected from one of two guest directories, so their entries arrive
//! under an `output/` or `source/` root. [`LayerBuilder`] rewrites them into one flat
//! layer namespace and digests the layer while it is written.

use crate::error::{PublishError, Result};
use crate::image::digest::DigestWriter;
use crate::output::OutputManager;
use flate2::read::GzDecoder;
use std::borrow::Cow;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

/// Guest-side roots stripped from artifact entries
pub const SYNTHETIC_ROOTS: [&str; 2] = ["output/", "source/"];

/// Result of writing one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerInfo {
    pub path: PathBuf,
    /// `sha256:` digest of the uncompressed layer bytes on disk
    pub diff_id: String,
    pub size: u64,
    pub entries: usize,
    pub skipped: usize,
}

impl LayerInfo {
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Map an artifact entry name to its name inside the layer, or `None` to drop it.
pub fn normalize_entry_name(name: &str) -> Option<&str> {
    if name == "./" || name == "." {
        return None;
    }

    let stripped = SYNTHETIC_ROOTS
        .iter()
        .find_map(|root| name.strip_prefix(root))
        .unwrap_or(name);

    if stripped.is_empty() { None } else { Some(stripped) }
}

pub struct LayerBuilder {
    output: OutputManager,
}

impl LayerBuilder {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }

    /// Copy `source` (plain or gzip-compressed tar) into a flat layer at `destination`.
    ///
    /// An entry that would land outside the layer root, through a `..` component or
    /// an absolute path, fails the build instead of being copied.
    pub fn build(&self, source: &Path, destination: &Path) -> Result<LayerInfo> {
        self.output.step(&format!(
            "Building layer from {} into {}",
            source.display(),
            destination.display()
        ));

        let source_file = File::open(source)
            .map_err(|e| PublishError::build("Failed to open artifact tarball", e))?;
        let reader = open_tar_stream(source_file)
            .map_err(|e| PublishError::build("Failed to read artifact tarball", e))?;
        let mut archive = Archive::new(reader);

        let layer_file = File::create(destination)
            .map_err(|e| PublishError::build("Failed to create layer file", e))?;
        let mut builder = Builder::new(DigestWriter::new(BufWriter::new(layer_file)));

        let mut entries = 0usize;
        let mut skipped = 0usize;

        let source_entries = archive
            .entries()
            .map_err(|e| PublishError::build("Failed to read artifact entries", e))?;
        for entry in source_entries {
            let mut entry =
                entry.map_err(|e| PublishError::build("Failed to read artifact entry", e))?;

            let raw_name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let Some(name) = normalize_entry_name(&raw_name) else {
                skipped += 1;
                continue;
            };
            let name = name.to_string();

            let mut header = entry.header().clone();
            let entry_type = header.entry_type();

            if entry_type.is_symlink() || entry_type.is_hard_link() {
                let target = entry
                    .link_name_bytes()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                let target = if entry_type.is_hard_link() {
                    normalize_entry_name(&target)
                        .map(str::to_string)
                        .unwrap_or(target)
                } else {
                    target
                };
                header.set_size(0);
                builder
                    .append_link(&mut header, &name, &target)
                    .map_err(|e| PublishError::build(&format!("Failed to write link {}", name), e))?;
            } else {
                header.set_size(entry.size());
                builder
                    .append_data(&mut header, &name, &mut entry)
                    .map_err(|e| PublishError::build(&format!("Failed to write entry {}", name), e))?;
            }

            self.output.trace(&format!("{} -> {}", raw_name, name));
            entries += 1;
        }

        let writer = builder
            .into_inner()
            .map_err(|e| PublishError::build("Failed to finish layer", e))?;
        let size = writer.bytes_written();
        let (buffered, diff_id) = writer.finish();
        let file = buffered
            .into_inner()
            .map_err(|e| PublishError::build("Failed to flush layer", e.into_error()))?;
        file.sync_all()
            .map_err(|e| PublishError::build("Failed to sync layer", e))?;

        if entries == 0 {
            self.output.warning("Layer is empty: no artifact entries survived normalization");
        }
        self.output.detail(&format!(
            "Layer written: {} entries ({} skipped), {}, {}",
            entries,
            skipped,
            self.output.format_size(size),
            diff_id
        ));

        Ok(LayerInfo {
            path: destination.to_path_buf(),
            diff_id,
            size,
            entries,
            skipped,
        })
    }
}

/// Wrap the source in a gzip decoder when it starts with the gzip magic bytes.
fn open_tar_stream(file: File) -> std::io::Result<Box<dyn Read>> {
    let mut reader = BufReader::new(file);
    let is_gzip = {
        let head = reader.fill_buf()?;
        head.len() >= 2 && head[0] == 0x1f && head[1] == 0x8b
    };

    if is_gzip {
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Entry name as stored, for callers that inspect produced layers.
pub fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> String {
    let name: Cow<'_, [u8]> = entry.path_bytes();
    String::from_utf8_lossy(&name).trim_end_matches('/').to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image::digest::DigestUtils;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{EntryType, Header};
    use tempfile::TempDir;

    pub(crate) enum Fixture<'a> {
        Dir(&'a str),
        File(&'a str, &'a [u8]),
        Symlink(&'a str, &'a str),
        HardLink(&'a str, &'a str),
    }

    /// Tar with names stored byte-for-byte, including `./`
    pub(crate) fn raw_tar<W: Write>(writer: W, fixtures: &[Fixture<'_>]) -> W {
        let mut builder = Builder::new(writer);
        for fixture in fixtures {
            let mut header = Header::new_gnu();
            let (name, data, entry_type, link): (&str, &[u8], EntryType, Option<&str>) =
                match fixture {
                    Fixture::Dir(name) => (*name, &b""[..], EntryType::Directory, None),
                    Fixture::File(name, data) => (*name, *data, EntryType::Regular, None),
                    Fixture::Symlink(name, target) => {
                        (*name, &b""[..], EntryType::Symlink, Some(*target))
                    }
                    Fixture::HardLink(name, target) => {
                        (*name, &b""[..], EntryType::Link, Some(*target))
                    }
                };
            {
                let gnu = header.as_gnu_mut().unwrap();
                gnu.name[..name.len()].copy_from_slice(name.as_bytes());
                if let Some(link) = link {
                    gnu.linkname[..link.len()].copy_from_slice(link.as_bytes());
                }
            }
            header.set_entry_type(entry_type);
            header.set_size(data.len() as u64);
            header.set_mode(if entry_type == EntryType::Directory { 0o755 } else { 0o644 });
            header.set_cksum();
            builder.append(&header, data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn artifact_fixtures() -> Vec<Fixture<'static>> {
        vec![
            Fixture::Dir("./"),
            Fixture::Dir("output/"),
            Fixture::Dir("output/bin/"),
            Fixture::File("output/bin/app", b"#!/bin/sh\necho hi\n"),
            Fixture::Symlink("output/app", "bin/app"),
            Fixture::HardLink("output/app-copy", "output/bin/app"),
            Fixture::File("source/README", b"readme"),
            Fixture::File("other/keep", b"kept as is"),
        ]
    }

    fn read_layer(path: &Path) -> Vec<(String, EntryType, Vec<u8>, Option<String>)> {
        let mut archive = Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry_name(&entry);
                let entry_type = entry.header().entry_type();
                let link = entry
                    .link_name_bytes()
                    .map(|b| String::from_utf8_lossy(&b).into_owned());
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (name, entry_type, data, link)
            })
            .collect()
    }

    #[test]
    fn test_normalize_entry_name() {
        assert_eq!(normalize_entry_name("./"), None);
        assert_eq!(normalize_entry_name("output/"), None);
        assert_eq!(normalize_entry_name("source/"), None);
        assert_eq!(normalize_entry_name("output/bin/app"), Some("bin/app"));
        assert_eq!(normalize_entry_name("source/README"), Some("README"));
        assert_eq!(normalize_entry_name("output/source/x"), Some("source/x"));
        assert_eq!(normalize_entry_name("other/keep"), Some("other/keep"));
    }

    #[test]
    fn test_layer_strips_synthetic_roots() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("artifact.tar");
        raw_tar(File::create(&source).unwrap(), &artifact_fixtures());

        let destination = dir.path().join("layer.tar");
        let layer = LayerBuilder::new(OutputManager::new_quiet())
            .build(&source, &destination)
            .unwrap();

        assert_eq!(layer.entries, 6);
        assert_eq!(layer.skipped, 2);

        let entries = read_layer(&destination);
        let names: Vec<&str> = entries.iter().map(|e| e.0.as_str()).collect();
        assert_eq!(names, vec!["bin", "bin/app", "app", "app-copy", "README", "other/keep"]);

        assert_eq!(entries[1].2, b"#!/bin/sh\necho hi\n");
        assert_eq!(entries[2].1, EntryType::Symlink);
        assert_eq!(entries[2].3.as_deref(), Some("bin/app"));
        assert_eq!(entries[3].1, EntryType::Link);
        assert_eq!(entries[3].3.as_deref(), Some("bin/app"));
        assert_eq!(entries[5].2, b"kept as is");
    }

    #[test]
    fn test_layer_digest_matches_bytes_on_disk() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("artifact.tar");
        raw_tar(File::create(&source).unwrap(), &artifact_fixtures());

        let destination = dir.path().join("layer.tar");
        let layer = LayerBuilder::new(OutputManager::new_quiet())
            .build(&source, &destination)
            .unwrap();

        let on_disk = std::fs::read(&destination).unwrap();
        assert_eq!(layer.size, on_disk.len() as u64);
        assert_eq!(layer.diff_id, format!("sha256:{}", DigestUtils::compute_sha256(&on_disk)));
    }

    #[test]
    fn test_gzip_artifact_is_accepted() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("artifact.tar.gz");
        let encoder = GzEncoder::new(File::create(&source).unwrap(), Compression::default());
        raw_tar(encoder, &artifact_fixtures()).finish().unwrap();

        let destination = dir.path().join("layer.tar");
        let layer = LayerBuilder::new(OutputManager::new_quiet())
            .build(&source, &destination)
            .unwrap();
        assert_eq!(layer.entries, 6);
    }

    #[test]
    fn test_empty_layer_is_valid() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("artifact.tar");
        raw_tar(
            File::create(&source).unwrap(),
            &[Fixture::Dir("./"), Fixture::Dir("output/")],
        );

        let destination = dir.path().join("layer.tar");
        let layer = LayerBuilder::new(OutputManager::new_quiet())
            .build(&source, &destination)
            .unwrap();

        assert!(layer.is_empty());
        assert!(read_layer(&destination).is_empty());
        assert_eq!(layer.size, 1024);
    }

    #[test]
    fn test_escaping_entries_fail_the_build() {
        for escaping in ["output/../escape", "/etc/passwd"] {
            let dir = TempDir::new().unwrap();
            let source = dir.path().join("artifact.tar");
            raw_tar(
                File::create(&source).unwrap(),
                &[
                    Fixture::File("output/bin/app", b"ok"),
                    Fixture::File(escaping, b"x"),
                ],
            );

            let result = LayerBuilder::new(OutputManager::new_quiet())
                .build(&source, &dir.path().join("layer.tar"));
            assert!(
                matches!(result, Err(PublishError::Build(_))),
                "{} must be rejected",
                escaping
            );
        }
    }

    #[test]
    fn test_missing_source_is_build_error() {
        let dir = TempDir::new().unwrap();
        let result = LayerBuilder::new(OutputManager::new_quiet())
            .build(&dir.path().join("missing.tar"), &dir.path().join("layer.tar"));
        assert!(matches!(result, Err(PublishError::Build(_))));
    }
}
