//! Container engine boundary
//!
//! [`Transport`] is everything the publisher asks of the engine. [`StatusSink`] is
//! where a push writes its status bytes: each chunk goes to the live log pipe and
//! to an in-memory buffer, in arrival order.

pub mod docker;

use crate::config::{CommitOptions, ContainerHandle};
use crate::error::{PublishError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use docker::DockerEngine;

/// Credentials forwarded to the engine for a push
#[derive(Clone, Default, Serialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(rename = "serveraddress", skip_serializing_if = "String::is_empty")]
    pub server_address: String,
}

impl RegistryCredentials {
    /// Value of the `X-Registry-Auth` header
    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE.encode(json))
    }
}

impl std::fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("username", &self.username)
            .field("server_address", &self.server_address)
            .finish_non_exhaustive()
    }
}

/// Destination of a push's status stream.
pub struct StatusSink {
    pipe: Option<mpsc::Sender<Vec<u8>>>,
    buffer: Vec<u8>,
    cancel: CancellationToken,
}

impl StatusSink {
    pub fn new(pipe: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) -> Self {
        Self {
            pipe: Some(pipe),
            buffer: Vec::new(),
            cancel,
        }
    }

    /// Buffer-only sink
    pub fn buffered() -> Self {
        Self {
            pipe: None,
            buffer: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Forward one chunk. Waits until the log forwarder took the previous one.
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.cancel.is_cancelled() {
            self.close();
            return Err(PublishError::Cancelled("push aborted by pipeline".to_string()));
        }

        self.buffer.extend_from_slice(chunk);

        if let Some(pipe) = self.pipe.clone() {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => None,
                sent = pipe.send(chunk.to_vec()) => Some(sent.is_ok()),
            };
            match sent {
                None => {
                    self.close();
                    return Err(PublishError::Cancelled("push aborted by pipeline".to_string()));
                }
                // Forwarder is gone; the buffer still holds everything.
                Some(false) => self.pipe = None,
                Some(true) => {}
            }
        }
        Ok(())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drop the pipe writer so the forwarder sees end of stream.
    pub fn close(&mut self) {
        self.pipe = None;
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_buffer(mut self) -> Vec<u8> {
        self.close();
        self.buffer
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Commit the container as `repository:tag`; returns the new image id.
    async fn commit(
        &self,
        container: &ContainerHandle,
        repository: &str,
        tag: &str,
        options: &CommitOptions,
    ) -> Result<String>;

    async fn tag(&self, image: &str, repository: &str, tag: &str, force: bool) -> Result<()>;

    /// Push `repository:tag`, writing every status chunk to `sink`.
    ///
    /// Fails when no chunk arrives within `inactivity` or the sink is cancelled.
    async fn push(
        &self,
        repository: &str,
        tag: &str,
        credentials: &RegistryCredentials,
        sink: &mut StatusSink,
        inactivity: Duration,
    ) -> Result<()>;

    async fn load(&self, archive: &Path) -> Result<()>;

    async fn remove_image(&self, name: &str) -> Result<()>;
}

/// Which guest directory to collect and where to put it on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub container: ContainerHandle,
    pub guest_path: String,
    pub host_path: PathBuf,
}

#[async_trait]
pub trait ArtifactCollector: Send + Sync {
    /// Tar the guest path to the host path. [`PublishError::EmptyTarball`] when
    /// nothing was collected.
    async fn collect(&self, spec: &ArtifactSpec) -> Result<PathBuf>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_header_is_url_safe_json() {
        let credentials = RegistryCredentials {
            username: "token".to_string(),
            password: "s3cr3t?>".to_string(),
            email: String::new(),
            server_address: "https://wcr.io/v2/".to_string(),
        };
        let encoded = credentials.encode().unwrap();
        assert!(!encoded.contains('+') && !encoded.contains('/'));

        let decoded = URL_SAFE.decode(encoded).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "token");
        assert_eq!(value["serveraddress"], "https://wcr.io/v2/");
        assert!(value.get("email").is_none());
        assert!(!format!("{:?}", credentials).contains("s3cr3t"));
    }

    #[tokio::test]
    async fn test_sink_fans_out_in_order() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut sink = StatusSink::new(tx, CancellationToken::new());

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(chunk) = rx.recv().await {
                seen.extend(chunk);
            }
            seen
        });

        for chunk in [&b"one\n"[..], b"two\n", b"three\n"] {
            sink.write(chunk).await.unwrap();
        }
        let buffer = sink.into_buffer();
        let piped = reader.await.unwrap();
        assert_eq!(buffer, b"one\ntwo\nthree\n");
        assert_eq!(piped, buffer);
    }

    #[tokio::test]
    async fn test_sink_survives_gone_forwarder() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let mut sink = StatusSink::new(tx, CancellationToken::new());
        sink.write(b"a").await.unwrap();
        sink.write(b"b").await.unwrap();
        assert_eq!(sink.buffer(), b"ab");
    }

    #[tokio::test]
    async fn test_cancelled_sink_rejects_writes() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut sink = StatusSink::new(tx, cancel.clone());
        sink.write(b"first").await.unwrap();

        // Pipe is full and nobody reads; cancellation must unblock the writer.
        let blocked = tokio::spawn(async move {
            let result = sink.write(b"second").await;
            (result, sink)
        });
        tokio::task::yield_now().await;
        cancel.cancel();

        let (result, sink) = blocked.await.unwrap();
        assert!(matches!(result, Err(PublishError::Cancelled(_))));
        assert!(sink.pipe.is_none());
    }
}
