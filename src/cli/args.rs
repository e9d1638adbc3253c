//! Command-line argument parsing

use crate::config::DEFAULT_INACTIVITY_TIMEOUT;
use crate::engine::docker::DEFAULT_DOCKER_HOST;
use crate::error::{PublishError, Result};
use clap::Parser;
use std::collections::HashMap;

#[derive(Parser, Debug, Clone)]
#[command(name = "image-publisher")]
#[command(about = "Commit or assemble a container image and push it to a registry")]
#[command(version, author)]
pub struct Args {
    /// Target repository
    #[arg(long = "repository", short = 'r', default_value = "", help = "Repository to push to; empty uses the built-in registry")]
    pub repository: String,

    #[arg(long = "registry", default_value = "", help = "Registry address; inferred from the repository when empty")]
    pub registry: String,

    #[arg(long = "tag", short = 't', help = "Tag to push (repeatable, comma or space separated)")]
    pub tags: Vec<String>,

    #[arg(long = "container", short = 'c', help = "Engine id of the pipeline container")]
    pub container: Option<String>,

    #[arg(long = "tarball", short = 'f', help = "Artifact tarball to build a scratch image from")]
    pub tarball: Option<String>,

    #[arg(long = "scratch", help = "Build a single-layer image from the container's artifacts instead of committing it")]
    pub scratch: bool,

    #[arg(long = "image", help = "Existing image name or id to tag and push")]
    pub image: Option<String>,

    #[arg(long = "local", help = "Tag the image locally without pushing")]
    pub local: bool,

    #[arg(long = "cleanup", help = "Remove the committed image after pushing")]
    pub cleanup: bool,

    #[arg(long = "no-force-tags", help = "Do not overwrite existing local tags")]
    pub no_force_tags: bool,

    #[arg(long = "username", short = 'u', help = "Username for registry authentication")]
    pub username: Option<String>,

    #[arg(long = "password", short = 'p', help = "Password for registry authentication")]
    pub password: Option<String>,

    #[arg(long = "email", help = "Email for registry authentication")]
    pub email: Option<String>,

    /// Raw step data, parsed like the pipeline's publish step
    #[arg(long = "data", short = 'd', value_name = "KEY=VALUE", help = "Publish step option (repeatable)")]
    pub data: Vec<String>,

    #[arg(long = "docker-host", default_value = DEFAULT_DOCKER_HOST, help = "Docker engine endpoint (tcp://host:port)")]
    pub docker_host: String,

    #[arg(long = "builtin-registry", default_value = "https://wcr.io/v2/", help = "URL of the pipeline's built-in registry")]
    pub builtin_registry: String,

    #[arg(long = "owner", default_value = "", help = "Application owner name")]
    pub owner: String,

    #[arg(long = "application", default_value = "", help = "Application name")]
    pub application: String,

    #[arg(long = "run-token", help = "Run token used for the built-in registry")]
    pub run_token: Option<String>,

    #[arg(long = "git-branch", default_value = "", help = "Branch used in the default built-in registry tag")]
    pub git_branch: String,

    #[arg(long = "git-commit", default_value = "", help = "Commit used in the default built-in registry tag")]
    pub git_commit: String,

    #[arg(long = "run-id", default_value = "", help = "Run id prefixed to --data image-name")]
    pub run_id: String,

    #[arg(long = "container-os", default_value = "linux", help = "Operating system recorded in scratch images")]
    pub container_os: String,

    #[arg(long = "work-dir", help = "Host directory for scratch files (defaults to the system temp dir)")]
    pub work_dir: Option<String>,

    #[arg(long = "guest-root", default_value = "/pipeline", help = "Pipeline mount point inside the container")]
    pub guest_root: String,

    #[arg(
        long = "inactivity-timeout",
        default_value_t = DEFAULT_INACTIVITY_TIMEOUT.as_secs(),
        help = "Seconds a push may go without progress"
    )]
    pub inactivity_timeout: u64,

    #[arg(long = "verbose", short = 'v', help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long = "quiet", short = 'q', conflicts_with = "verbose", help = "Only print warnings and errors")]
    pub quiet: bool,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        if self.container.is_none() && self.tarball.is_none() {
            return Err(PublishError::Configuration(
                "Either --container or --tarball is required".to_string(),
            ));
        }

        if let Some(tarball) = &self.tarball {
            if !std::path::Path::new(tarball).exists() {
                return Err(PublishError::Configuration(format!(
                    "Tarball does not exist: {}",
                    tarball
                )));
            }
        }

        if self.inactivity_timeout == 0 {
            return Err(PublishError::Configuration(
                "Inactivity timeout must be greater than 0".to_string(),
            ));
        }

        self.step_data()?;
        Ok(())
    }

    /// `--data` pairs as a map; later keys win.
    pub fn step_data(&self) -> Result<HashMap<String, String>> {
        self.data
            .iter()
            .map(|pair| {
                pair.split_once('=')
                    .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                    .ok_or_else(|| {
                        PublishError::Configuration(format!("--data expects KEY=VALUE, got '{}'", pair))
                    })
            })
            .collect()
    }

    /// Fill unset values from `IMAGE_PUBLISHER_*` variables and `DOCKER_HOST`.
    pub fn from_env(mut self) -> Self {
        if self.username.is_none() {
            self.username = std::env::var("IMAGE_PUBLISHER_USERNAME").ok();
        }

        if self.password.is_none() {
            self.password = std::env::var("IMAGE_PUBLISHER_PASSWORD").ok();
        }

        if self.run_token.is_none() {
            self.run_token = std::env::var("IMAGE_PUBLISHER_RUN_TOKEN").ok();
        }

        if self.registry.is_empty() {
            if let Ok(registry) = std::env::var("IMAGE_PUBLISHER_REGISTRY") {
                self.registry = registry;
            }
        }

        if self.docker_host == DEFAULT_DOCKER_HOST {
            if let Ok(host) = std::env::var("DOCKER_HOST") {
                self.docker_host = host;
            }
        }

        if let Ok(timeout) = std::env::var("IMAGE_PUBLISHER_INACTIVITY_TIMEOUT") {
            if let Ok(t) = timeout.parse() {
                self.inactivity_timeout = t;
            }
        }

        if std::env::var("IMAGE_PUBLISHER_VERBOSE").is_ok() && !self.quiet {
            self.verbose = true;
        }

        self
    }

    pub fn print_examples() {
        println!("Examples:");
        println!("  # Commit the pipeline container and push it to the built-in registry");
        println!("  image-publisher --container 4f1c2e --owner acme --application api \\");
        println!("                  --run-token $RUN_TOKEN --git-branch main --git-commit 1a2b3c");
        println!();
        println!("  # Push a scratch image built from an artifact tarball");
        println!("  image-publisher -f output.tar -r quay.io/acme/api -t v1.2.0 -u robot -p secret");
        println!();
        println!("  # Tag only, using step data");
        println!("  image-publisher -c 4f1c2e --local -d repository=acme/api -d tag=\"v1 latest\"");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let args = Args::try_parse_from(["image-publisher", "-c", "abc", "-t", "v1", "-t", "v2"]).unwrap();
        assert_eq!(args.container.as_deref(), Some("abc"));
        assert_eq!(args.tags, vec!["v1", "v2"]);
        assert_eq!(args.inactivity_timeout, 300);
        assert_eq!(args.docker_host, DEFAULT_DOCKER_HOST);
        args.validate().unwrap();
    }

    #[test]
    fn test_source_is_required() {
        let args = Args::try_parse_from(["image-publisher", "-r", "a/b"]).unwrap();
        assert!(matches!(args.validate(), Err(PublishError::Configuration(_))));
    }

    #[test]
    fn test_step_data_pairs() {
        let args = Args::try_parse_from([
            "image-publisher",
            "-c",
            "abc",
            "-d",
            "tag=v1 v2",
            "-d",
            "labels=a=b",
        ])
        .unwrap();
        let data = args.step_data().unwrap();
        assert_eq!(data["tag"], "v1 v2");
        assert_eq!(data["labels"], "a=b");

        let bad = Args::try_parse_from(["image-publisher", "-c", "abc", "-d", "novalue"]).unwrap();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Args::try_parse_from(["image-publisher", "-c", "x", "-q", "-v"]).is_err());
    }
}
