//! Runs one publish from command line arguments

use crate::cli::args::Args;
use crate::config::{
    ContainerHandle, PipelineContext, PublishMode, PublishRequest, PublishRequestBuilder,
    split_space_or_comma,
};
use crate::engine::DockerEngine;
use crate::error::{PublishError, Result};
use crate::output::OutputManager;
use crate::publish::{ConsoleEventSink, PublishReport, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

pub struct Runner {
    args: Args,
    output: OutputManager,
}

impl Runner {
    pub fn new(args: Args) -> Self {
        let output = if args.quiet {
            OutputManager::new_quiet()
        } else {
            OutputManager::new(args.verbose)
        };

        Self { args, output }
    }

    pub fn output(&self) -> &OutputManager {
        &self.output
    }

    pub async fn run(&self) -> Result<PublishReport> {
        self.output.section("Image Publisher");
        self.validate_arguments()?;

        let ctx = self.pipeline_context()?;
        let request = self.publish_request(&ctx)?;

        let engine = Arc::new(
            DockerEngine::builder(&self.args.docker_host)
                .with_output(self.output.clone())
                .build()?,
        );
        engine.require_endpoint().await?;

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        let interrupt_output = self.output.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupt_output.warning("Interrupted - aborting push");
                on_interrupt.cancel();
            }
        });

        let publisher = Publisher::builder(ctx)
            .with_transport(engine.clone())
            .with_collector(engine)
            .with_events(Arc::new(ConsoleEventSink::new(self.output.clone())))
            .with_output(self.output.clone())
            .with_cancellation(cancel)
            .build()?;

        let report = publisher.publish(&request).await?;
        self.output.summary("Publish summary", &[
            ("Repository", report.repository.clone()),
            ("Image", report.image_id.clone()),
            ("Tags", report.pushed_tags().join(", ")),
        ]);
        Ok(report)
    }

    fn validate_arguments(&self) -> Result<()> {
        self.output.subsection("Validating arguments");
        self.args.validate()?;
        self.output.step("Arguments validation passed");
        Ok(())
    }

    fn pipeline_context(&self) -> Result<PipelineContext> {
        let builtin_registry = Url::parse(&self.args.builtin_registry).map_err(|e| {
            PublishError::Configuration(format!(
                "Invalid built-in registry '{}': {}",
                self.args.builtin_registry, e
            ))
        })?;
        let host_root = self
            .args
            .work_dir
            .clone()
            .map(Into::into)
            .unwrap_or_else(std::env::temp_dir);

        let mut ctx = PipelineContext::new(builtin_registry, host_root);
        ctx.application_owner = self.args.owner.clone();
        ctx.application_name = self.args.application.clone();
        ctx.auth_token = self.args.run_token.clone().unwrap_or_default();
        ctx.git_branch = self.args.git_branch.clone();
        ctx.git_commit = self.args.git_commit.clone();
        ctx.run_id = self.args.run_id.clone();
        ctx.container_os = self.args.container_os.clone();
        ctx.guest_root = self.args.guest_root.clone();
        Ok(ctx)
    }

    /// Step data first, explicit flags on top.
    fn publish_request(&self, ctx: &PipelineContext) -> Result<PublishRequest> {
        let args = &self.args;
        let mut builder = PublishRequestBuilder::from_step_data(&args.step_data()?, ctx)?;

        if !args.repository.is_empty() {
            builder = builder.repository(args.repository.clone());
        }
        if !args.registry.is_empty() {
            builder = builder.registry(&args.registry);
        }
        let tags: Vec<String> = args
            .tags
            .iter()
            .flat_map(|tag| split_space_or_comma(tag))
            .collect();
        if !tags.is_empty() {
            builder = builder.tags(tags);
        }
        if let Some(image) = &args.image {
            builder = builder.image(image.clone());
        }
        if let (Some(username), Some(password)) = (&args.username, &args.password) {
            builder = builder.credentials(username.clone(), password.clone());
        }
        if let Some(container) = &args.container {
            builder = builder.container(ContainerHandle::new(container.clone()));
        }
        if let Some(tarball) = &args.tarball {
            builder = builder.artifact(tarball);
        }
        if args.scratch {
            builder = builder.mode(PublishMode::Scratch);
        }
        if let Some(email) = &args.email {
            builder = builder.email(email.clone());
        }

        if args.local {
            builder = builder.local(true);
        }
        if args.cleanup {
            builder = builder.cleanup_after_push(true);
        }
        if args.no_force_tags {
            builder = builder.force_tags(false);
        }

        builder
            .inactivity_timeout(Duration::from_secs(args.inactivity_timeout))
            .build()
    }
}
