//! Deferred release actions of one publish

use crate::engine::Transport;
use crate::image::archive::ScratchWorkspace;
use crate::output::OutputManager;

#[derive(Debug, Clone)]
pub enum Release {
    RemoveWorkspace(ScratchWorkspace),
    /// Remove `repository:tag` from the engine
    RemoveImage(String),
}

/// Release actions registered during a publish.
///
/// Run once at the end, latest registration first. Failures are logged and never
/// change the outcome of the publish.
#[derive(Debug, Default)]
pub struct ReleaseList {
    actions: Vec<Release>,
}

impl ReleaseList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, release: Release) {
        if let Release::RemoveImage(name) = &release {
            let duplicate = self
                .actions
                .iter()
                .any(|existing| matches!(existing, Release::RemoveImage(other) if other == name));
            if duplicate {
                return;
            }
        }
        self.actions.push(release);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Execute every action; returns how many failed.
    pub async fn run(self, transport: &dyn Transport, output: &OutputManager) -> usize {
        let mut failures = 0;
        for release in self.actions.into_iter().rev() {
            match release {
                Release::RemoveWorkspace(workspace) => match workspace.remove() {
                    Ok(()) => output.detail(&format!(
                        "Removed scratch directory {}",
                        workspace.root().display()
                    )),
                    Err(e) => {
                        failures += 1;
                        output.warning(&format!(
                            "Failed to remove scratch directory {}: {}",
                            workspace.root().display(),
                            e
                        ));
                    }
                },
                Release::RemoveImage(name) => match transport.remove_image(&name).await {
                    Ok(()) => output.verbose(&format!("Removed image {}", name)),
                    Err(e) => {
                        failures += 1;
                        output.warning(&format!("Failed to delete image {}: {}", name, e));
                    }
                },
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_images_are_registered_once() {
        let mut releases = ReleaseList::new();
        releases.push(Release::RemoveImage("a/b:v1".to_string()));
        releases.push(Release::RemoveImage("a/b:v1".to_string()));
        releases.push(Release::RemoveImage("a/b:v2".to_string()));
        assert_eq!(releases.len(), 2);
    }
}
