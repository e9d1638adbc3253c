//! Registry access checks
//!
//! Every publish checks push access before it mutates anything. The generic
//! [`RegistryAuthenticator`] speaks the Docker Registry v2 challenge flow; the
//! built-in registry reuses it with the run token as credentials. Cloud provider
//! authenticators are supplied by the caller.

use crate::config::{AuthOptions, BUILTIN_REGISTRY_USERNAME, PipelineContext};
use crate::error::{PublishError, Result};
use crate::output::OutputManager;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use oci_client::Reference;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Registry API endpoint used for repositories without a domain
pub const HUB_REGISTRY_URL: &str = "https://registry-1.docker.io/v2/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
}

impl Action {
    /// Actions requested in a token scope
    pub fn scope_actions(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push,pull",
        }
    }

    /// Action a token grant must carry
    pub fn required_grant(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(false)` means the registry answered and denied access.
    async fn check_access(&self, repository: &str, action: Action) -> Result<bool>;

    fn username(&self) -> String;

    fn password(&self) -> String;

    fn email(&self) -> String {
        String::new()
    }

    /// Provider specific repository name for a user supplied one
    fn repository(&self, raw: &str) -> String {
        raw.to_string()
    }
}

/// Which authenticator a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthProvider {
    Builtin,
    DockerRegistry,
    Aws,
    Azure,
}

impl AuthProvider {
    pub fn select(auth: &AuthOptions, registry_url: &str, ctx: &PipelineContext) -> Self {
        if auth.uses_azure() {
            AuthProvider::Azure
        } else if auth.uses_aws() {
            AuthProvider::Aws
        } else if ctx.is_builtin_registry(registry_url) {
            AuthProvider::Builtin
        } else {
            AuthProvider::DockerRegistry
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthProvider::Builtin => "builtin",
            AuthProvider::DockerRegistry => "docker",
            AuthProvider::Aws => "aws",
            AuthProvider::Azure => "azure",
        }
    }
}

#[derive(Debug)]
struct AuthChallenge {
    scheme: ChallengeScheme,
    realm: String,
    service: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChallengeScheme {
    Basic,
    Bearer,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Claims of a registry JWT that matter for the access check
#[derive(Debug, Deserialize)]
struct TokenClaims {
    access: Option<Vec<AccessGrant>>,
}

#[derive(Debug, Deserialize)]
struct AccessGrant {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    actions: Vec<String>,
}

/// Credentials presented after the challenge
enum Grant<'a> {
    Basic,
    Bearer(&'a str),
}

/// Docker Registry v2 authenticator for explicit credentials
pub struct RegistryAuthenticator {
    client: Client,
    /// Empty for the public hub
    registry_url: String,
    hub_url: String,
    username: String,
    password: String,
    email: String,
    output: OutputManager,
}

impl RegistryAuthenticator {
    pub fn new(
        registry_url: &str,
        username: &str,
        password: &str,
        output: OutputManager,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| PublishError::Authorization(format!("Failed to create auth client: {}", e)))?;

        Ok(Self {
            client,
            registry_url: registry_url.to_string(),
            hub_url: HUB_REGISTRY_URL.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            email: String::new(),
            output: output.scoped("auth"),
        })
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = email.to_string();
        self
    }

    /// Registry endpoint used when the repository lives on the hub
    pub fn with_hub_url(mut self, hub_url: &str) -> Self {
        self.hub_url = hub_url.to_string();
        self
    }

    /// API base and repository path the access check runs against
    fn target(&self, repository: &str) -> (String, String) {
        let path = repository
            .parse::<Reference>()
            .map(|reference| reference.repository().to_string())
            .unwrap_or_else(|_| repository.to_string());

        if self.registry_url.is_empty() {
            let path = if path.contains('/') {
                path
            } else {
                format!("library/{}", path)
            };
            (ensure_trailing_slash(&self.hub_url), path)
        } else {
            (ensure_trailing_slash(&self.registry_url), path)
        }
    }

    fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    async fn get_auth_challenge(&self, base: &str) -> Result<Option<AuthChallenge>> {
        self.output.detail(&format!("Sending auth challenge request to {}", base));
        let response = self
            .client
            .get(base)
            .send()
            .await
            .map_err(|e| PublishError::Authorization(format!("Failed to reach registry {}: {}", base, e)))?;

        let status = response.status();
        self.output
            .detail(&format!("Auth challenge response status: {}", status));

        if status.is_success() {
            return Ok(None);
        }
        if status != StatusCode::UNAUTHORIZED {
            return Err(unexpected_status("registry ping", status));
        }

        let header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.output.detail(&format!("Parsing auth header: {}", header));

        parse_auth_challenge(&header).map(Some).ok_or_else(|| {
            PublishError::Authorization(format!("Unsupported auth challenge from {}: '{}'", base, header))
        })
    }

    async fn get_token(&self, challenge: &AuthChallenge, scope: &str) -> Result<Option<String>> {
        self.output.detail(&format!(
            "Requesting token from: {} (service={}, scope={})",
            challenge.realm, challenge.service, scope
        ));

        let mut request = self
            .client
            .get(&challenge.realm)
            .query(&[("service", challenge.service.as_str()), ("scope", scope)]);
        if self.has_credentials() {
            request = request.basic_auth(&self.username, Some(&self.password));
        }
        let response = request
            .send()
            .await
            .map_err(|e| PublishError::Authorization(format!("Failed to get auth token: {}", e)))?;

        let status = response.status();
        if is_denied(status) {
            self.output
                .warning(&format!("Token request denied with status {}", status));
            return Ok(None);
        }
        if !status.is_success() {
            return Err(unexpected_status("token request", status));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PublishError::Authorization(format!("Failed to parse token response: {}", e)))?;
        let token = token.token.or(token.access_token).filter(|t| !t.is_empty());
        if let Some(token) = &token {
            self.output
                .detail(&format!("Token obtained (length: {} chars)", token.len()));
        }
        Ok(token)
    }

    fn authorize(&self, request: RequestBuilder, grant: &Grant<'_>) -> RequestBuilder {
        match grant {
            Grant::Basic => request.basic_auth(&self.username, Some(&self.password)),
            Grant::Bearer(token) => request.bearer_auth(token),
        }
    }

    /// Ask the registry itself: push needs an upload session, pull a plain ping.
    async fn verify_grant(&self, base: &str, path: &str, action: Action, grant: &Grant<'_>) -> Result<bool> {
        match action {
            Action::Pull => {
                let response = self
                    .authorize(self.client.get(base), grant)
                    .send()
                    .await
                    .map_err(|e| PublishError::Authorization(format!("Access check failed: {}", e)))?;
                access_verdict(response.status(), "access check")
            }
            Action::Push => self.open_upload_session(base, path, grant).await,
        }
    }

    async fn open_upload_session(&self, base: &str, path: &str, grant: &Grant<'_>) -> Result<bool> {
        let url = format!("{}{}/blobs/uploads/", base, path);
        self.output.detail(&format!("Checking push access with POST {}", url));
        let response = self
            .authorize(self.client.post(&url), grant)
            .send()
            .await
            .map_err(|e| PublishError::Authorization(format!("Upload session request failed: {}", e)))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let allowed = access_verdict(status, "upload session")?;

        // Abandon the session opened for the check.
        if let Some(location) = location {
            if let Ok(session) = url::Url::parse(base).and_then(|base| base.join(&location)) {
                let cancelled = self.authorize(self.client.delete(session), grant).send().await;
                if let Err(e) = cancelled {
                    self.output.debug(&format!("Failed to cancel upload session: {}", e));
                }
            }
        }
        Ok(allowed)
    }
}

#[async_trait]
impl Authenticator for RegistryAuthenticator {
    async fn check_access(&self, repository: &str, action: Action) -> Result<bool> {
        let (base, path) = self.target(repository);
        self.output.verbose(&format!(
            "Checking {} access to {} at {}",
            action.scope_actions(),
            path,
            base
        ));

        let Some(challenge) = self.get_auth_challenge(&base).await? else {
            self.output
                .info("No authentication challenge - registry may not require auth");
            return Ok(true);
        };

        match challenge.scheme {
            ChallengeScheme::Basic => {
                if !self.has_credentials() {
                    return Ok(false);
                }
                self.verify_grant(&base, &path, action, &Grant::Basic).await
            }
            ChallengeScheme::Bearer => {
                let scope = format!("repository:{}:{}", path, action.scope_actions());
                let Some(token) = self.get_token(&challenge, &scope).await? else {
                    return Ok(false);
                };
                match granted_actions(&token, &path) {
                    Some(actions) => {
                        let required = action.required_grant();
                        let allowed = actions.iter().any(|granted| granted == required || granted == "*");
                        if !allowed {
                            self.output.warning(&format!(
                                "Token for {} grants [{}] but not {}",
                                path,
                                actions.join(","),
                                required
                            ));
                        }
                        Ok(allowed)
                    }
                    None => {
                        self.verify_grant(&base, &path, action, &Grant::Bearer(&token))
                            .await
                    }
                }
            }
        }
    }

    fn username(&self) -> String {
        self.username.clone()
    }

    fn password(&self) -> String {
        self.password.clone()
    }

    fn email(&self) -> String {
        self.email.clone()
    }
}

/// The runner's own registry, authorized with the run token.
pub struct BuiltinAuthenticator {
    inner: RegistryAuthenticator,
}

impl BuiltinAuthenticator {
    pub fn new(ctx: &PipelineContext, output: OutputManager) -> Result<Self> {
        let inner = RegistryAuthenticator::new(
            ctx.builtin_registry.as_str(),
            BUILTIN_REGISTRY_USERNAME,
            &ctx.auth_token,
            output,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Authenticator for BuiltinAuthenticator {
    async fn check_access(&self, repository: &str, action: Action) -> Result<bool> {
        self.inner.check_access(repository, action).await
    }

    fn username(&self) -> String {
        self.inner.username()
    }

    fn password(&self) -> String {
        self.inner.password()
    }
}

/// Build the authenticator for providers this crate implements itself.
///
/// Cloud providers need an injected authenticator and yield a configuration error.
pub fn authenticator_for(
    provider: AuthProvider,
    registry_url: &str,
    auth: &AuthOptions,
    ctx: &PipelineContext,
    output: &OutputManager,
) -> Result<Box<dyn Authenticator>> {
    match provider {
        AuthProvider::Builtin => Ok(Box::new(BuiltinAuthenticator::new(ctx, output.clone())?)),
        AuthProvider::DockerRegistry => Ok(Box::new(
            RegistryAuthenticator::new(registry_url, &auth.username, &auth.password, output.clone())?
                .with_email(&auth.email),
        )),
        AuthProvider::Aws | AuthProvider::Azure => Err(PublishError::Configuration(format!(
            "The {} registry provider requires an externally supplied authenticator",
            provider.name()
        ))),
    }
}

fn parse_auth_challenge(header: &str) -> Option<AuthChallenge> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    let scheme = if scheme.eq_ignore_ascii_case("bearer") {
        ChallengeScheme::Bearer
    } else if scheme.eq_ignore_ascii_case("basic") {
        ChallengeScheme::Basic
    } else {
        return None;
    };

    let params: HashMap<String, String> = params
        .split(',')
        .filter_map(|param| param.split_once('='))
        .map(|(key, value)| {
            (
                key.trim().to_ascii_lowercase(),
                value.trim().trim_matches('"').to_string(),
            )
        })
        .collect();

    let realm = params.get("realm").cloned().unwrap_or_default();
    if scheme == ChallengeScheme::Bearer && realm.is_empty() {
        return None;
    }
    Some(AuthChallenge {
        scheme,
        realm,
        service: params.get("service").cloned().unwrap_or_default(),
    })
}

/// Actions a JWT grants on `path`; `None` for tokens without readable access claims.
fn granted_actions(token: &str, path: &str) -> Option<Vec<String>> {
    let mut segments = token.split('.');
    let (Some(_), Some(payload), Some(_), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return None;
    };
    let payload = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: TokenClaims = serde_json::from_slice(&payload).ok()?;

    Some(
        claims
            .access?
            .into_iter()
            .filter(|grant| grant.kind == "repository" && grant.name == path)
            .flat_map(|grant| grant.actions)
            .collect(),
    )
}

fn access_verdict(status: StatusCode, what: &str) -> Result<bool> {
    if status.is_success() {
        Ok(true)
    } else if is_denied(status) {
        Ok(false)
    } else {
        Err(unexpected_status(what, status))
    }
}

fn is_denied(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn unexpected_status(what: &str, status: StatusCode) -> PublishError {
    PublishError::Authorization(format!("Unexpected status {} from {}", status, what))
}

fn ensure_trailing_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_string()
    } else {
        format!("{}/", url)
    }
}
