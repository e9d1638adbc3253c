//! Configuration for a single publish request
//!
//! A [`PublishRequest`] is built once, either through [`PublishRequestBuilder`] or by
//! parsing the step's key/value data, validated, and never mutated afterwards.

use crate::error::{PublishError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Inactivity window for a push before it is treated as stalled
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Username sent to the built-in registry; only the token matters there
pub const BUILTIN_REGISTRY_USERNAME: &str = "token";

/// Facts about the running pipeline that the publish step needs.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub application_owner: String,
    pub application_name: String,
    /// Canonical URL of the runner's own registry, e.g. `https://wcr.io/v2/`
    pub builtin_registry: Url,
    pub auth_token: String,
    pub git_branch: String,
    pub git_commit: String,
    pub run_id: String,
    pub container_os: String,
    /// Host directory private to this run
    pub host_root: PathBuf,
    /// Mount point of the pipeline inside the container
    pub guest_root: String,
}

impl PipelineContext {
    pub fn new(builtin_registry: Url, host_root: impl Into<PathBuf>) -> Self {
        Self {
            application_owner: String::new(),
            application_name: String::new(),
            builtin_registry,
            auth_token: String::new(),
            git_branch: String::new(),
            git_commit: String::new(),
            run_id: String::new(),
            container_os: "linux".to_string(),
            host_root: host_root.into(),
            guest_root: "/pipeline".to_string(),
        }
    }

    pub fn builtin_registry_host(&self) -> String {
        match self.builtin_registry.port() {
            Some(port) => format!("{}:{}", self.builtin_registry.host_str().unwrap_or_default(), port),
            None => self.builtin_registry.host_str().unwrap_or_default().to_string(),
        }
    }

    pub fn is_builtin_registry(&self, registry: &str) -> bool {
        registry == self.builtin_registry.as_str()
    }

    pub fn host_path(&self, parts: &[&str]) -> PathBuf {
        parts.iter().fold(self.host_root.clone(), |path, part| path.join(part))
    }

    pub fn guest_path(&self, part: &str) -> String {
        format!("{}/{}", self.guest_root.trim_end_matches('/'), part)
    }

    /// Guest directory holding the checked out source
    pub fn source_path(&self) -> String {
        self.guest_path("source")
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct AwsOptions {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub registry_id: String,
    pub strict_auth: bool,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct AzureOptions {
    pub client_id: String,
    pub client_secret: String,
    pub subscription_id: String,
    pub tenant_id: String,
    pub resource_group: String,
    pub registry_name: String,
    pub login_server: String,
}

/// Explicit credentials and cloud provider settings from the step.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthOptions {
    pub username: String,
    pub password: String,
    pub email: String,
    pub aws: AwsOptions,
    pub azure: AzureOptions,
}

impl AuthOptions {
    pub fn uses_aws(&self) -> bool {
        !self.aws.secret_key.is_empty()
    }

    pub fn uses_azure(&self) -> bool {
        !self.azure.client_secret.is_empty()
    }

    /// Cloud registries bring their own repository naming, so no inference is done.
    pub fn uses_cloud_provider(&self) -> bool {
        self.uses_aws() || self.uses_azure()
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .field("email", &self.email)
            .field("aws_access_key", &self.aws.access_key)
            .field("aws_secret_key", &redact(&self.aws.secret_key))
            .field("aws_region", &self.aws.region)
            .field("azure_client_id", &self.azure.client_id)
            .field("azure_client_secret", &redact(&self.azure.client_secret))
            .finish()
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "<redacted>" }
}

/// Engine-side identifier of the pipeline container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle(String);

impl ContainerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    /// 16-character form used as the image hostname
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(16) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the image content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSource {
    Container(ContainerHandle),
    Artifact(PathBuf),
}

impl LayerSource {
    pub fn container(&self) -> Option<&ContainerHandle> {
        match self {
            LayerSource::Container(handle) => Some(handle),
            LayerSource::Artifact(_) => None,
        }
    }
}

/// How the image is materialized before tagging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// Commit the live container through the engine
    Commit,
    /// Assemble a single-layer image from a tarball and load it
    Scratch,
}

/// Runtime configuration baked into the committed or assembled image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOptions {
    pub author: String,
    pub message: String,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub entrypoint: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    pub user: Option<String>,
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishFlags {
    /// Tag only, never contact a registry
    pub local: bool,
    pub force_tags: bool,
    pub cleanup_after_push: bool,
}

impl Default for PublishFlags {
    fn default() -> Self {
        Self {
            local: false,
            force_tags: true,
            cleanup_after_push: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub repository: String,
    pub registry: String,
    pub tags: Vec<String>,
    pub commit: CommitOptions,
    /// Existing image to tag and push instead of materializing a new one
    pub image: Option<String>,
    pub flags: PublishFlags,
    pub source: LayerSource,
    pub mode: PublishMode,
    pub auth: AuthOptions,
    pub inactivity_timeout: Duration,
}

impl PublishRequest {
    pub fn builder() -> PublishRequestBuilder {
        PublishRequestBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tags.iter().any(|tag| tag.trim().is_empty()) {
            return Err(PublishError::Configuration(
                "Tags must not be empty".to_string(),
            ));
        }

        if self.inactivity_timeout.is_zero() {
            return Err(PublishError::Configuration(
                "Inactivity timeout must be greater than 0".to_string(),
            ));
        }

        if self.image.is_none()
            && self.mode == PublishMode::Commit
            && self.source.container().is_none()
        {
            return Err(PublishError::Configuration(
                "Committing an image requires a container; use scratch mode for artifact tarballs"
                    .to_string(),
            ));
        }

        if self.image.is_some() && self.mode == PublishMode::Scratch {
            return Err(PublishError::Configuration(
                "image-name cannot be combined with a scratch push".to_string(),
            ));
        }

        if let LayerSource::Artifact(path) = &self.source {
            if path.as_os_str().is_empty() {
                return Err(PublishError::Configuration(
                    "Artifact tarball path is empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Builder for [`PublishRequest`]
#[derive(Debug, Clone)]
pub struct PublishRequestBuilder {
    repository: String,
    registry: String,
    tags: Vec<String>,
    commit: CommitOptions,
    image: Option<String>,
    flags: PublishFlags,
    source: Option<LayerSource>,
    mode: PublishMode,
    auth: AuthOptions,
    inactivity_timeout: Duration,
}

impl Default for PublishRequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishRequestBuilder {
    pub fn new() -> Self {
        Self {
            repository: String::new(),
            registry: String::new(),
            tags: Vec::new(),
            commit: CommitOptions::default(),
            image: None,
            flags: PublishFlags::default(),
            source: None,
            mode: PublishMode::Commit,
            auth: AuthOptions::default(),
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
        }
    }

    /// Parse the publish step's data map.
    ///
    /// Unknown keys are ignored. Values that are shell-word split fail the step when
    /// their quoting is broken.
    pub fn from_step_data(data: &HashMap<String, String>, ctx: &PipelineContext) -> Result<Self> {
        let mut builder = Self::new();
        let get = |key: &str| data.get(key).map(|value| value.as_str());

        if let Some(repository) = get("repository") {
            builder.repository = repository.to_string();
        }
        if let Some(registry) = get("registry") {
            builder.registry = normalize_registry(registry);
        }
        if let Some(tags) = get("tag") {
            builder.tags = split_space_or_comma(tags);
        }
        if let Some(author) = get("author") {
            builder.commit.author = author.to_string();
        }
        if let Some(message) = get("message") {
            builder.commit.message = message.to_string();
        }
        if let Some(ports) = get("ports") {
            builder.commit.ports = parse_ports(ports);
        }
        if let Some(volumes) = get("volumes") {
            builder.commit.volumes = split_space_or_comma(volumes).into_iter().collect();
        }
        if let Some(working_dir) = get("working-dir") {
            builder.commit.working_dir = Some(working_dir.to_string());
        }
        if let Some(cmd) = get("cmd") {
            builder.commit.cmd = Some(split_shell_words("cmd", cmd)?);
        }
        if let Some(entrypoint) = get("entrypoint") {
            builder.commit.entrypoint = Some(split_shell_words("entrypoint", entrypoint)?);
        }
        if let Some(env) = get("env") {
            builder.commit.env = split_shell_words("env", env)?;
        }
        if let Some(stop_signal) = get("stopsignal") {
            builder.commit.stop_signal = Some(stop_signal.to_string());
        }
        if let Some(labels) = get("labels") {
            builder.commit.labels = split_shell_words("labels", labels)?
                .iter()
                .filter_map(|pair| pair.split_once('='))
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect();
        }
        if let Some(user) = get("user") {
            builder.commit.user = Some(user.to_string());
        }
        if let Some(force_tags) = get("force-tags") {
            builder.flags.force_tags = parse_bool(force_tags);
        }
        if let Some(image) = get("image-name") {
            builder.image = Some(format!("{}{}", ctx.run_id, image));
        }

        let auth = &mut builder.auth;
        let fields: [(&str, &mut String); 13] = [
            ("username", &mut auth.username),
            ("password", &mut auth.password),
            ("email", &mut auth.email),
            ("aws-access-key", &mut auth.aws.access_key),
            ("aws-secret-key", &mut auth.aws.secret_key),
            ("aws-region", &mut auth.aws.region),
            ("aws-registry-id", &mut auth.aws.registry_id),
            ("azure-client-id", &mut auth.azure.client_id),
            ("azure-client-secret", &mut auth.azure.client_secret),
            ("azure-subscription-id", &mut auth.azure.subscription_id),
            ("azure-tenant-id", &mut auth.azure.tenant_id),
            ("azure-resource-group", &mut auth.azure.resource_group),
            ("azure-registry-name", &mut auth.azure.registry_name),
        ];
        for (key, field) in fields {
            if let Some(value) = data.get(key) {
                *field = value.clone();
            }
        }
        if let Some(login_server) = get("azure-login-server") {
            auth.azure.login_server = login_server.to_string();
        }
        if let Some(strict) = get("aws-strict-auth") {
            auth.aws.strict_auth = parse_bool(strict);
        }

        Ok(builder)
    }

    pub fn repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn registry(mut self, registry: &str) -> Self {
        self.registry = normalize_registry(registry);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn commit_options(mut self, commit: CommitOptions) -> Self {
        self.commit = commit;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn flags(mut self, flags: PublishFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn local(mut self, local: bool) -> Self {
        self.flags.local = local;
        self
    }

    pub fn force_tags(mut self, force_tags: bool) -> Self {
        self.flags.force_tags = force_tags;
        self
    }

    pub fn cleanup_after_push(mut self, cleanup: bool) -> Self {
        self.flags.cleanup_after_push = cleanup;
        self
    }

    pub fn container(mut self, handle: ContainerHandle) -> Self {
        self.source = Some(LayerSource::Container(handle));
        self
    }

    pub fn artifact(mut self, tarball: impl AsRef<Path>) -> Self {
        self.source = Some(LayerSource::Artifact(tarball.as_ref().to_path_buf()));
        self.mode = PublishMode::Scratch;
        self
    }

    pub fn mode(mut self, mode: PublishMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn auth(mut self, auth: AuthOptions) -> Self {
        self.auth = auth;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth.username = username.into();
        self.auth.password = password.into();
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.auth.email = email.into();
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<PublishRequest> {
        let source = self.source.ok_or_else(|| {
            PublishError::Configuration(
                "A publish request needs either a container or an artifact tarball".to_string(),
            )
        })?;

        let request = PublishRequest {
            repository: self.repository,
            registry: self.registry,
            tags: self.tags,
            commit: self.commit,
            image: self.image,
            flags: self.flags,
            source,
            mode: self.mode,
            auth: self.auth,
            inactivity_timeout: self.inactivity_timeout,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Bring a user supplied registry address into `https://host[/path]/v2/` form.
///
/// Empty stays empty (public hub). Addresses that do not parse are returned
/// untouched so that the resolver can report them.
pub fn normalize_registry(address: &str) -> String {
    let address = address.trim();
    if address.is_empty() {
        return String::new();
    }

    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    };

    let mut url = match Url::parse(&with_scheme) {
        Ok(url) if url.host_str().is_some() => url,
        _ => return address.to_string(),
    };

    let path = url.path().trim_end_matches('/').to_string();
    let has_version = path
        .rsplit('/')
        .next()
        .map(|segment| segment == "v1" || segment == "v2")
        .unwrap_or(false);
    let path = if has_version {
        format!("{}/", path)
    } else {
        format!("{}/v2/", path)
    };
    url.set_path(&path);
    url.to_string()
}

/// Split on whitespace and commas, dropping empty pieces.
pub fn split_space_or_comma(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_ports(input: &str) -> BTreeSet<String> {
    split_space_or_comma(input)
        .into_iter()
        .map(|port| {
            if port.contains('/') {
                port
            } else {
                format!("{}/tcp", port)
            }
        })
        .collect()
}

/// Shell-word split a step value; broken quoting is a configuration error.
fn split_shell_words(key: &str, input: &str) -> Result<Vec<String>> {
    shell_words::split(input).map_err(|e| {
        PublishError::Configuration(format!("Invalid value for '{}' ({}): {}", key, e, input))
    })
}

/// Boolean step value: `1 t T TRUE true True` and `0 f F FALSE false False`.
/// Anything else reads as false.
pub fn parse_bool(input: &str) -> bool {
    matches!(input.trim(), "1" | "t" | "T" | "TRUE" | "true" | "True")
}
