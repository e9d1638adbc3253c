//! Docker Engine API transport over TCP

use crate::config::{CommitOptions, ContainerHandle};
use crate::engine::{ArtifactCollector, ArtifactSpec, RegistryCredentials, StatusSink, Transport};
use crate::error::{PublishError, Result};
use crate::image::config::RuntimeConfig;
use crate::output::OutputManager;
use crate::registry::status::PushStatusRecord;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client, Response, StatusCode};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

pub const DEFAULT_DOCKER_HOST: &str = "tcp://127.0.0.1:2375";

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version", default)]
    version: String,
    #[serde(rename = "ApiVersion", default)]
    api_version: String,
}

pub struct DockerEngineBuilder {
    host: String,
    connect_timeout: Duration,
    output: Option<OutputManager>,
}

impl DockerEngineBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            connect_timeout: Duration::from_secs(15),
            output: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_output(mut self, output: OutputManager) -> Self {
        self.output = Some(output);
        self
    }

    pub fn build(self) -> Result<DockerEngine> {
        let base_url = engine_base_url(&self.host)?;
        let client = Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| PublishError::Configuration(format!("Failed to create engine client: {}", e)))?;
        let output = self.output.unwrap_or_else(|| OutputManager::new(false));

        Ok(DockerEngine {
            client,
            base_url,
            output: output.scoped("engine"),
        })
    }
}

/// Engine client implementing [`Transport`] and [`ArtifactCollector`]
pub struct DockerEngine {
    client: Client,
    base_url: String,
    output: OutputManager,
}

impl DockerEngine {
    pub fn builder(host: &str) -> DockerEngineBuilder {
        DockerEngineBuilder::new(host)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Confirm the endpoint answers before anything is committed or pushed.
    pub async fn require_endpoint(&self) -> Result<()> {
        let url = format!("{}/version", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            PublishError::Configuration(format!(
                "You don't seem to have a working Docker environment or the docker host is wrong ({}): {}",
                self.base_url, e
            ))
        })?;

        if !response.status().is_success() {
            return Err(PublishError::Configuration(format!(
                "Docker endpoint {} refused the version check with status {}",
                self.base_url,
                response.status()
            )));
        }

        let version: VersionResponse = response.json().await.map_err(|e| {
            PublishError::Configuration(format!("Docker endpoint {} is not an engine API: {}", self.base_url, e))
        })?;
        self.output.verbose(&format!(
            "Docker engine {} (API {}) at {}",
            version.version, version.api_version, self.base_url
        ));
        Ok(())
    }

    async fn expect_success(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(PublishError::Transport(format!(
            "{} failed with status {}: {}",
            what,
            status,
            body.trim()
        )))
    }
}

#[async_trait]
impl Transport for DockerEngine {
    async fn commit(
        &self,
        container: &ContainerHandle,
        repository: &str,
        tag: &str,
        options: &CommitOptions,
    ) -> Result<String> {
        self.output
            .step(&format!("Committing container {} as {}:{}", container.short(), repository, tag));

        let config = RuntimeConfig::from_commit(options, "");
        let response = self
            .client
            .post(format!("{}/commit", self.base_url))
            .query(&[
                ("container", container.id()),
                ("repo", repository),
                ("tag", tag),
                ("author", options.author.as_str()),
                ("comment", options.message.as_str()),
            ])
            .json(&config)
            .send()
            .await?;
        let response = self.expect_success(response, "Commit").await?;

        let committed: CommitResponse = response.json().await?;
        self.output.detail(&format!("Committed image {}", committed.id));
        Ok(committed.id)
    }

    async fn tag(&self, image: &str, repository: &str, tag: &str, force: bool) -> Result<()> {
        self.output
            .detail(&format!("Tagging {} as {}:{}", image, repository, tag));
        let response = self
            .client
            .post(format!("{}/images/{}/tag", self.base_url, image))
            .query(&[
                ("repo", repository),
                ("tag", tag),
                ("force", if force { "1" } else { "0" }),
            ])
            .send()
            .await?;
        self.expect_success(response, "Tag").await?;
        Ok(())
    }

    async fn push(
        &self,
        repository: &str,
        tag: &str,
        credentials: &RegistryCredentials,
        sink: &mut StatusSink,
        inactivity: Duration,
    ) -> Result<()> {
        let cancel = sink.cancellation().clone();
        let request = self
            .client
            .post(format!("{}/images/{}/push", self.base_url, repository))
            .query(&[("tag", tag)])
            .header("X-Registry-Auth", credentials.encode()?)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => None,
            response = tokio::time::timeout(inactivity, request) => Some(response),
        };
        let response = match response {
            None => {
                sink.close();
                return Err(PublishError::Cancelled(format!("push of {}:{} aborted", repository, tag)));
            }
            Some(Err(_)) => return Err(inactivity_error(repository, tag, inactivity)),
            Some(Ok(response)) => self.expect_success(response?, "Push").await?,
        };

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(inactivity, stream.next()) => Some(next),
            };
            match next {
                None => {
                    sink.close();
                    return Err(PublishError::Cancelled(format!("push of {}:{} aborted", repository, tag)));
                }
                Some(Err(_)) => return Err(inactivity_error(repository, tag, inactivity)),
                Some(Ok(None)) => break,
                Some(Ok(Some(chunk))) => sink.write(&chunk?).await?,
            }
        }
        Ok(())
    }

    async fn load(&self, archive: &Path) -> Result<()> {
        let file = tokio::fs::File::open(archive)
            .await
            .map_err(|e| PublishError::build("Failed to open image archive", e))?;
        let size = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        self.output.step(&format!(
            "Loading image archive ({})",
            self.output.format_size(size)
        ));

        let response = self
            .client
            .post(format!("{}/images/load", self.base_url))
            .query(&[("quiet", "1")])
            .header(CONTENT_TYPE, "application/x-tar")
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let response = self.expect_success(response, "Load").await?;

        let body = response.bytes().await?;
        let records = serde_json::Deserializer::from_slice(&body).into_iter::<PushStatusRecord>();
        for record in records.flatten() {
            if let Some(message) = record.failure() {
                return Err(PublishError::Transport(format!("Load failed: {}", message)));
            }
        }
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/images/{}", self.base_url, name))
            .send()
            .await?;
        self.expect_success(response, &format!("Removing image {}", name))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactCollector for DockerEngine {
    async fn collect(&self, spec: &ArtifactSpec) -> Result<PathBuf> {
        self.output.step(&format!(
            "Collecting {} from container {}",
            spec.guest_path,
            spec.container.short()
        ));

        let response = self
            .client
            .get(format!("{}/containers/{}/archive", self.base_url, spec.container.id()))
            .query(&[("path", spec.guest_path.as_str())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(PublishError::EmptyTarball(format!(
                "{} does not exist in the container",
                spec.guest_path
            )));
        }
        let response = self.expect_success(response, "Archive").await?;

        let mut file = tokio::fs::File::create(&spec.host_path)
            .await
            .map_err(|e| PublishError::build("Failed to create artifact tarball", e))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?)
                .await
                .map_err(|e| PublishError::build("Failed to write artifact tarball", e))?;
        }
        file.flush()
            .await
            .map_err(|e| PublishError::build("Failed to flush artifact tarball", e))?;

        let path = spec.host_path.clone();
        let files = tokio::task::spawn_blocking(move || count_regular_files(&path))
            .await
            .map_err(|e| PublishError::build("Artifact scan failed", e))??;
        if files == 0 {
            return Err(PublishError::EmptyTarball(format!(
                "No files collected from {}",
                spec.guest_path
            )));
        }

        self.output
            .detail(&format!("Collected {} file(s) from {}", files, spec.guest_path));
        Ok(spec.host_path.clone())
    }
}

fn count_regular_files(path: &Path) -> Result<usize> {
    let file = std::fs::File::open(path)
        .map_err(|e| PublishError::build("Failed to open artifact tarball", e))?;
    let mut archive = tar::Archive::new(file);
    let entries = archive
        .entries()
        .map_err(|e| PublishError::build("Failed to read artifact tarball", e))?;

    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| PublishError::build("Failed to read artifact entry", e))?;
        if entry.header().entry_type().is_file() {
            count += 1;
        }
    }
    Ok(count)
}

fn inactivity_error(repository: &str, tag: &str, inactivity: Duration) -> PublishError {
    PublishError::Transport(format!(
        "Push of {}:{} made no progress for {}s",
        repository,
        tag,
        inactivity.as_secs()
    ))
}

/// `tcp://host:port` (or bare `host:port`) to an HTTP base URL.
pub fn engine_base_url(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('/');
    let base = if let Some(rest) = host.strip_prefix("tcp://") {
        format!("http://{}", rest)
    } else if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else if host.contains("://") {
        return Err(PublishError::Configuration(format!(
            "Unsupported docker host '{}': only tcp:// endpoints are supported",
            host
        )));
    } else if host.is_empty() {
        return Err(PublishError::Configuration("Docker host is empty".to_string()));
    } else {
        format!("http://{}", host)
    };

    url::Url::parse(&base)
        .ok()
        .filter(|url| url.host_str().is_some())
        .map(|_| base.clone())
        .ok_or_else(|| PublishError::Configuration(format!("Invalid docker host '{}'", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn engine(server: &MockServer) -> DockerEngine {
        DockerEngine::builder(&server.uri())
            .with_output(OutputManager::new_quiet())
            .build()
            .unwrap()
    }

    #[test]
    fn test_engine_base_url() {
        assert_eq!(engine_base_url("tcp://10.0.0.1:2375").unwrap(), "http://10.0.0.1:2375");
        assert_eq!(engine_base_url("localhost:2375/").unwrap(), "http://localhost:2375");
        assert_eq!(engine_base_url("https://engine.example").unwrap(), "https://engine.example");
        assert!(engine_base_url("unix:///var/run/docker.sock").is_err());
        assert!(engine_base_url("").is_err());
    }

    #[tokio::test]
    async fn test_require_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"Version": "24.0.7", "ApiVersion": "1.43"})),
            )
            .mount(&server)
            .await;
        engine(&server).require_endpoint().await.unwrap();
    }

    #[tokio::test]
    async fn test_require_endpoint_reports_configuration_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = engine(&server).require_endpoint().await.unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_commit_sends_runtime_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/commit"))
            .and(query_param("container", "abc123"))
            .and(query_param("repo", "reg.example/a/b"))
            .and(query_param("tag", "v1"))
            .and(body_json(serde_json::json!({"Hostname": "", "Cmd": ["/app"]})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"Id": "sha256:feed"})))
            .mount(&server)
            .await;

        let options = CommitOptions {
            cmd: Some(vec!["/app".to_string()]),
            ..CommitOptions::default()
        };
        let id = engine(&server)
            .commit(&ContainerHandle::new("abc123"), "reg.example/a/b", "v1", &options)
            .await
            .unwrap();
        assert_eq!(id, "sha256:feed");
    }

    #[tokio::test]
    async fn test_tag_failure_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/sha256:feed/tag"))
            .respond_with(ResponseTemplate::new(404).set_body_string("No such image"))
            .mount(&server)
            .await;

        let err = engine(&server)
            .tag("sha256:feed", "a/b", "v1", true)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Transport(ref m) if m.contains("No such image")));
    }

    #[tokio::test]
    async fn test_push_streams_into_sink() {
        let server = MockServer::start().await;
        let body = "{\"status\":\"Pushing\"}\n{\"aux\":{\"Tag\":\"v1\"}}\n";
        Mock::given(method("POST"))
            .and(path("/images/reg.example/a/b/push"))
            .and(query_param("tag", "v1"))
            .and(header_exists("x-registry-auth"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::channel(1);
        let forwarded = tokio::spawn(async move {
            let mut all = Vec::new();
            while let Some(chunk) = rx.recv().await {
                all.extend(chunk);
            }
            all
        });

        let mut sink = StatusSink::new(tx, CancellationToken::new());
        engine(&server)
            .push(
                "reg.example/a/b",
                "v1",
                &RegistryCredentials::default(),
                &mut sink,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        let buffer = sink.into_buffer();
        assert_eq!(buffer, body.as_bytes());
        assert_eq!(forwarded.await.unwrap(), buffer);
    }

    #[tokio::test]
    async fn test_push_inactivity_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/a/b/push"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut sink = StatusSink::buffered();
        let err = engine(&server)
            .push("a/b", "v1", &RegistryCredentials::default(), &mut sink, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Transport(ref m) if m.contains("no progress")));
    }

    #[tokio::test]
    async fn test_load_reports_engine_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/load"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"errorDetail":{"message":"bad layer"},"error":"bad layer"}"#),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("image.tar");
        std::fs::write(&archive, vec![0u8; 1024]).unwrap();

        let err = engine(&server).load(&archive).await.unwrap_err();
        assert!(matches!(err, PublishError::Transport(ref m) if m.contains("bad layer")));
    }

    #[tokio::test]
    async fn test_collect_empty_archive() {
        let server = MockServer::start().await;
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder.append_data(&mut header, "output", std::io::empty()).unwrap();
        let empty = builder.into_inner().unwrap();

        Mock::given(method("GET"))
            .and(path("/containers/abc/archive"))
            .and(query_param("path", "/pipeline/output"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(empty))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/containers/abc/archive"))
            .and(query_param("path", "/pipeline/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let engine = engine(&server);
        let spec = ArtifactSpec {
            container: ContainerHandle::new("abc"),
            guest_path: "/pipeline/output".to_string(),
            host_path: dir.path().join("output.tar"),
        };
        let err = engine.collect(&spec).await.unwrap_err();
        assert!(matches!(err, PublishError::EmptyTarball(_)));

        let missing = ArtifactSpec {
            guest_path: "/pipeline/missing".to_string(),
            ..spec
        };
        assert!(matches!(engine.collect(&missing).await, Err(PublishError::EmptyTarball(_))));
    }

    #[tokio::test]
    async fn test_collect_writes_tarball() {
        let server = MockServer::start().await;
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        builder.append_data(&mut header, "output/a", &b"hi"[..]).unwrap();
        let tarball = builder.into_inner().unwrap();

        Mock::given(method("GET"))
            .and(path("/containers/abc/archive"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(tarball.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let spec = ArtifactSpec {
            container: ContainerHandle::new("abc"),
            guest_path: "/pipeline/output".to_string(),
            host_path: dir.path().join("output.tar"),
        };
        let path = engine(&server).collect(&spec).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), tarball);
    }
}
