//! Registry and repository inference
//!
//! Reconciles a possibly partial `repository` / `registry` pair from the step with
//! the pipeline's built-in registry. The repository's own domain always wins over a
//! conflicting registry address.

use crate::config::PipelineContext;
use crate::error::{PublishError, Result};
use crate::output::OutputManager;
use oci_client::Reference;
use url::Url;

/// Registry names that denote the public hub
pub const HUB_DOMAINS: [&str; 2] = ["docker.io", "index.docker.io"];

/// Where the image goes. Computed once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Lower-case, never empty
    pub repository: String,
    /// `https://host[/path]/v2/`, or empty for the public hub
    pub registry_url: String,
}

impl ResolvedIdentity {
    pub fn is_hub(&self) -> bool {
        self.registry_url.is_empty()
    }

    /// `host[:port]` of the registry URL, `None` for the hub
    pub fn registry_host(&self) -> Option<String> {
        Url::parse(&self.registry_url).ok().and_then(|url| host_with_port(&url))
    }

    pub fn image_name(&self, tag: &str) -> String {
        format!("{}:{}", self.repository, tag)
    }
}

pub struct RegistryResolver {
    output: OutputManager,
}

impl RegistryResolver {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }

    pub fn resolve(
        &self,
        repository: &str,
        registry: &str,
        ctx: &PipelineContext,
    ) -> Result<ResolvedIdentity> {
        if repository.trim().is_empty() {
            if ctx.application_owner.trim().is_empty() || ctx.application_name.trim().is_empty() {
                return Err(PublishError::Configuration(
                    "No repository specified and the application owner or name is unknown".to_string(),
                ));
            }
            let repository = format!(
                "{}/{}/{}",
                ctx.builtin_registry_host(),
                ctx.application_owner,
                ctx.application_name
            )
            .to_lowercase();
            self.output
                .info(&format!("No repository specified - using {}", repository));
            self.output.verbose(
                "username/password are ignored for the built-in registry; the run token is used instead",
            );
            return Ok(ResolvedIdentity {
                repository,
                registry_url: ctx.builtin_registry.to_string(),
            });
        }

        let mut repository = repository.trim().to_lowercase();
        let domain = match repository.parse::<Reference>() {
            Ok(reference) => explicit_domain(&reference),
            Err(e) => {
                self.output.debug(&format!("{}; treating as hub repository", e));
                None
            }
        };
        let inferred_registry = domain
            .as_ref()
            .map(|domain| format!("https://{}/v2/", domain))
            .unwrap_or_default();

        if registry.trim().is_empty() {
            return Ok(ResolvedIdentity {
                repository,
                registry_url: inferred_registry,
            });
        }

        let registry_host = Url::parse(registry.trim())
            .ok()
            .and_then(|url| host_with_port(&url));
        let Some(registry_host) = registry_host else {
            self.output
                .error(&format!("Invalid registry url specified: {}", registry));
            if inferred_registry.is_empty() {
                return Err(PublishError::Configuration(format!(
                    "Invalid registry url '{}'. Please specify a valid registry; omit it to use Docker Hub",
                    registry
                )));
            }
            self.output.info(&format!(
                "Using registry url inferred from repository: {}",
                inferred_registry
            ));
            return Ok(ResolvedIdentity {
                repository,
                registry_url: inferred_registry,
            });
        };

        let registry_url = match domain {
            Some(domain) if domain != registry_host => {
                self.output.info(&format!(
                    "Different registry hosts specified in repository: {} and registry: {}",
                    domain, registry_host
                ));
                self.output.info(&format!(
                    "Using registry inferred from repository: {}",
                    inferred_registry
                ));
                inferred_registry
            }
            Some(_) => registry.trim().to_string(),
            None => {
                repository = format!("{}/{}", registry_host, repository);
                self.output.info(&format!(
                    "Using repository inferred from registry: {}",
                    repository
                ));
                registry.trim().to_string()
            }
        };

        Ok(ResolvedIdentity {
            repository,
            registry_url,
        })
    }
}

/// Registry named in the reference, `None` when it is the hub
pub fn explicit_domain(reference: &Reference) -> Option<String> {
    let registry = reference.registry();
    if HUB_DOMAINS.contains(&registry) {
        None
    } else {
        Some(registry.to_string())
    }
}

fn host_with_port(url: &Url) -> Option<String> {
    let host = url.host_str().filter(|host| !host.is_empty())?;
    Some(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}
