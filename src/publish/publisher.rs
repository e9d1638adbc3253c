//! Publish orchestration
//!
//! `Resolve -> Authorize -> Materialize -> for each tag { Tag -> Push -> Verify } -> Release`
//!
//! Tags are pushed strictly one after another and the first failing tag aborts the
//! request. Release actions registered along the way always run.

use crate::config::{LayerSource, PipelineContext, PublishMode, PublishRequest};
use crate::engine::{ArtifactCollector, ArtifactSpec, RegistryCredentials, Transport};
use crate::error::{PublishError, Result};
use crate::image::archive::ScratchWorkspace;
use crate::image::scratch::{ScratchAssembler, ScratchImage};
use crate::output::OutputManager;
use crate::publish::cleanup::{Release, ReleaseList};
use crate::publish::events::{ConsoleEventSink, EventSink, PublishEvent};
use crate::publish::stream::status_pipe;
use crate::publish::tags::build_tags;
use crate::registry::auth::{Action, AuthProvider, Authenticator, authenticator_for};
use crate::registry::resolver::{RegistryResolver, ResolvedIdentity};
use crate::registry::status::StatusDecoder;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of one tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReport {
    pub tag: String,
    /// `false` for tags that were only tagged locally
    pub pushed: bool,
    pub digest: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub exit_code: i32,
    pub repository: String,
    pub registry_url: String,
    pub image_id: String,
    pub tags: Vec<TagReport>,
    pub duration: Duration,
}

impl PublishReport {
    pub fn pushed_tags(&self) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|tag| tag.pushed)
            .map(|tag| tag.tag.as_str())
            .collect()
    }
}

pub struct PublisherBuilder {
    ctx: PipelineContext,
    transport: Option<Arc<dyn Transport>>,
    collector: Option<Arc<dyn ArtifactCollector>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    events: Option<Arc<dyn EventSink>>,
    output: OutputManager,
    cancel: CancellationToken,
}

impl PublisherBuilder {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            transport: None,
            collector: None,
            authenticator: None,
            events: None,
            output: OutputManager::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn ArtifactCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Use this authenticator instead of selecting one from the request.
    /// Required for cloud provider registries.
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_output(mut self, output: OutputManager) -> Self {
        self.output = output;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<Publisher> {
        let transport = self.transport.ok_or_else(|| {
            PublishError::Configuration("A publisher needs an engine transport".to_string())
        })?;
        let events = self
            .events
            .unwrap_or_else(|| Arc::new(ConsoleEventSink::new(self.output.clone())));

        Ok(Publisher {
            ctx: self.ctx,
            transport,
            collector: self.collector,
            authenticator: self.authenticator,
            events,
            output: self.output,
            cancel: self.cancel,
        })
    }
}

pub struct Publisher {
    ctx: PipelineContext,
    transport: Arc<dyn Transport>,
    collector: Option<Arc<dyn ArtifactCollector>>,
    authenticator: Option<Arc<dyn Authenticator>>,
    events: Arc<dyn EventSink>,
    output: OutputManager,
    cancel: CancellationToken,
}

/// State carried from authorization into tagging and pushing
struct Target {
    identity: ResolvedIdentity,
    provider: AuthProvider,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl Publisher {
    pub fn builder(ctx: PipelineContext) -> PublisherBuilder {
        PublisherBuilder::new(ctx)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn publish(&self, request: &PublishRequest) -> Result<PublishReport> {
        let started = Instant::now();
        self.output.section("Publishing image");
        request.validate()?;

        let mut releases = ReleaseList::new();
        let result = self.run(request, &mut releases, started).await;

        let failures = releases.run(self.transport.as_ref(), &self.output).await;
        if failures > 0 {
            self.output
                .warning(&format!("{} cleanup action(s) failed", failures));
        }

        match result {
            Ok(report) => {
                self.output.success(&format!(
                    "Published {} tag(s) of {} in {}",
                    report.pushed_tags().len(),
                    report.repository,
                    self.output.format_duration(report.duration)
                ));
                Ok(report)
            }
            Err(e) => {
                self.events.emit(PublishEvent::Failed {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        request: &PublishRequest,
        releases: &mut ReleaseList,
        started: Instant,
    ) -> Result<PublishReport> {
        let target = self.authorize(request).await?;
        let repository = match &target.authenticator {
            Some(authenticator) => authenticator.repository(&target.identity.repository),
            None => target.identity.repository.clone(),
        };

        let tags = build_tags(
            &request.tags,
            target.provider == AuthProvider::Builtin,
            &self.ctx.git_branch,
            &self.ctx.git_commit,
        );
        self.output.fields(
            "Push to registry",
            &[
                ("repository", repository.clone()),
                ("registry", target.identity.registry_url.clone()),
                ("tags", tags.join(",")),
                ("provider", target.provider.name().to_string()),
            ],
        );

        if self.cancel.is_cancelled() {
            return Err(PublishError::Cancelled(format!(
                "before building an image for {}",
                repository
            )));
        }
        let image_id = self.materialize(request, &repository, &tags, releases).await?;
        let reports = self
            .tag_and_push(request, &target, &repository, &image_id, &tags)
            .await?;

        Ok(PublishReport {
            exit_code: 0,
            repository,
            registry_url: target.identity.registry_url,
            image_id,
            tags: reports,
            duration: started.elapsed(),
        })
    }

    async fn authorize(&self, request: &PublishRequest) -> Result<Target> {
        self.output.subsection("Resolving registry");

        let identity = if request.auth.uses_cloud_provider() {
            // Cloud registries name repositories themselves.
            ResolvedIdentity {
                repository: request.repository.clone(),
                registry_url: request.registry.clone(),
            }
        } else {
            RegistryResolver::new(self.output.scoped("resolver")).resolve(
                &request.repository,
                &request.registry,
                &self.ctx,
            )?
        };
        let provider = AuthProvider::select(&request.auth, &identity.registry_url, &self.ctx);

        if request.flags.local {
            self.output
                .info("Local mode: images are tagged but not pushed");
            return Ok(Target {
                identity,
                provider,
                authenticator: self.authenticator.clone(),
            });
        }

        let authenticator: Arc<dyn Authenticator> = match &self.authenticator {
            Some(authenticator) => authenticator.clone(),
            None => Arc::from(authenticator_for(
                provider,
                &identity.registry_url,
                &request.auth,
                &self.ctx,
                &self.output,
            )?),
        };

        self.output.step(&format!("Checking push access to {}", identity.repository));
        let allowed = authenticator
            .check_access(&identity.repository, Action::Push)
            .await
            .map_err(|e| {
                PublishError::Authorization(format!(
                    "Error interacting with this repository: {} {}",
                    identity.repository, e
                ))
            })?;
        if !allowed {
            return Err(PublishError::Authorization(format!(
                "Not allowed to interact with this repository: {}",
                identity.repository
            )));
        }

        Ok(Target {
            identity,
            provider,
            authenticator: Some(authenticator),
        })
    }

    /// Produce the image to tag; returns its id or name.
    async fn materialize(
        &self,
        request: &PublishRequest,
        repository: &str,
        tags: &[String],
        releases: &mut ReleaseList,
    ) -> Result<String> {
        if let Some(image) = &request.image {
            self.output.info(&format!("Using existing image {}", image));
            return Ok(image.clone());
        }

        match request.mode {
            PublishMode::Scratch => self.materialize_scratch(request, repository, tags, releases).await,
            PublishMode::Commit => {
                let container = request.source.container().ok_or_else(|| {
                    PublishError::Configuration("Committing an image requires a container".to_string())
                })?;
                let first_tag = tags.first().map(String::as_str).unwrap_or_default();
                let image_id = self
                    .transport
                    .commit(container, repository, first_tag, &request.commit)
                    .await?;
                if request.flags.cleanup_after_push {
                    releases.push(Release::RemoveImage(format!("{}:{}", repository, first_tag)));
                }
                Ok(image_id)
            }
        }
    }

    async fn materialize_scratch(
        &self,
        request: &PublishRequest,
        repository: &str,
        tags: &[String],
        releases: &mut ReleaseList,
    ) -> Result<String> {
        let workspace = ScratchWorkspace::create(&self.ctx.host_path(&["scratch"]))?;
        releases.push(Release::RemoveWorkspace(workspace.clone()));

        let artifact = match &request.source {
            LayerSource::Artifact(path) => path.clone(),
            LayerSource::Container(handle) => self.collect_artifacts(handle, &workspace).await?,
        };

        let output = self.output.scoped("scratch");
        let commit = request.commit.clone();
        let container = request.source.container().cloned();
        let os = self.ctx.container_os.clone();
        let repository_name = repository.to_string();
        let tag_list = tags.to_vec();
        let build_workspace = workspace.clone();
        let archive = tokio::task::spawn_blocking(move || {
            let image = ScratchImage {
                commit: &commit,
                container: container.as_ref(),
                os: &os,
                repository: &repository_name,
                tags: &tag_list,
            };
            ScratchAssembler::new(output).assemble(&build_workspace, &artifact, &image)
        })
        .await
        .map_err(|e| PublishError::build("Scratch assembly task failed", e))??;

        self.transport.load(&archive.path).await?;
        self.output.info(&format!("Loaded scratch image {}", archive.layer_id));
        Ok(archive.layer_id)
    }

    /// Collect the guest output dir, falling back to the source dir when it is empty.
    async fn collect_artifacts(
        &self,
        container: &crate::config::ContainerHandle,
        workspace: &ScratchWorkspace,
    ) -> Result<PathBuf> {
        let collector = self.collector.as_ref().ok_or_else(|| {
            PublishError::Configuration(
                "Scratch images from a container need an artifact collector".to_string(),
            )
        })?;

        let output_spec = ArtifactSpec {
            container: container.clone(),
            guest_path: self.ctx.guest_path("output"),
            host_path: workspace.artifact_path(),
        };
        match collector.collect(&output_spec).await {
            Err(PublishError::EmptyTarball(reason)) => {
                self.output.warning(&format!(
                    "No artifacts in {} ({}); using {}",
                    output_spec.guest_path,
                    reason,
                    self.ctx.source_path()
                ));
                let source_spec = ArtifactSpec {
                    guest_path: self.ctx.source_path(),
                    host_path: workspace.root().join("source.tar"),
                    ..output_spec
                };
                collector.collect(&source_spec).await
            }
            other => other,
        }
    }

    async fn tag_and_push(
        &self,
        request: &PublishRequest,
        target: &Target,
        repository: &str,
        image_id: &str,
        tags: &[String],
    ) -> Result<Vec<TagReport>> {
        let decoder = StatusDecoder::new(self.output.scoped("status"));
        let mut reports: Vec<TagReport> = Vec::with_capacity(tags.len());

        for tag in tags {
            if self.cancel.is_cancelled() {
                return Err(self.abort(
                    &reports,
                    PublishError::Cancelled(format!("before pushing {}:{}", repository, tag)),
                ));
            }

            self.transport
                .tag(image_id, repository, tag, request.flags.force_tags)
                .await
                .map_err(|e| self.abort(&reports, e))?;

            if request.flags.local {
                self.output.info(&format!("Tagged {}:{}", repository, tag));
                reports.push(TagReport {
                    tag: tag.clone(),
                    pushed: false,
                    digest: None,
                });
                continue;
            }

            self.output.step(&format!("Pushing image for tag {}", tag));
            let credentials = self.credentials(target);
            let (mut sink, forwarder) = status_pipe(self.cancel.child_token(), self.events.clone());
            let pushed = self
                .transport
                .push(repository, tag, &credentials, &mut sink, request.inactivity_timeout)
                .await;
            let buffer = sink.into_buffer();
            let forwarded = forwarder.finish().await;
            self.output
                .trace(&format!("{} status line(s) forwarded for {}", forwarded, tag));
            pushed.map_err(|e| self.abort(&reports, e))?;

            let outcome = decoder
                .verify(&buffer, tag)
                .map_err(|e| self.abort(&reports, e))?;

            self.events.emit(PublishEvent::Pushed {
                repository: repository.to_string(),
                tag: tag.clone(),
                digest: outcome.digest.clone(),
            });
            reports.push(TagReport {
                tag: tag.clone(),
                pushed: true,
                digest: outcome.digest,
            });
        }

        Ok(reports)
    }

    fn credentials(&self, target: &Target) -> RegistryCredentials {
        match &target.authenticator {
            Some(authenticator) => RegistryCredentials {
                username: authenticator.username(),
                password: authenticator.password(),
                email: authenticator.email(),
                server_address: target.identity.registry_url.clone(),
            },
            None => RegistryCredentials::default(),
        }
    }

    /// Log what was already pushed before `err` ends the request.
    fn abort(&self, reports: &[TagReport], err: PublishError) -> PublishError {
        let pushed: Vec<&str> = reports
            .iter()
            .filter(|report| report.pushed)
            .map(|report| report.tag.as_str())
            .collect();
        if !pushed.is_empty() {
            self.output.warning(&format!(
                "Tags pushed before the failure: {}",
                pushed.join(", ")
            ));
        }
        self.output.error(&format!("Failed to push: {}", err));
        err
    }
}
