//! Live forwarding of push status to the pipeline log
//!
//! The push writes into a [`StatusSink`]; a forwarder task on the other end of a
//! one-slot channel renders each complete status line as a log event. The writer
//! cannot run more than one chunk ahead of the forwarder.

use crate::engine::StatusSink;
use crate::publish::events::{EventSink, PublishEvent};
use crate::registry::status::PushStatusRecord;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const PIPE_CAPACITY: usize = 1;

pub struct LogForwarder {
    handle: JoinHandle<usize>,
}

impl LogForwarder {
    pub fn spawn(mut pipe: mpsc::Receiver<Vec<u8>>, events: Arc<dyn EventSink>) -> Self {
        let handle = tokio::spawn(async move {
            let mut pending: Vec<u8> = Vec::new();
            let mut forwarded = 0usize;

            while let Some(chunk) = pipe.recv().await {
                pending.extend_from_slice(&chunk);
                while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    if let Some(rendered) = render_status_line(&line) {
                        events.emit(PublishEvent::Log(rendered));
                        forwarded += 1;
                    }
                }
            }

            // Writer closed; flush a final unterminated line.
            if let Some(rendered) = render_status_line(&pending) {
                events.emit(PublishEvent::Log(rendered));
                forwarded += 1;
            }
            forwarded
        });
        Self { handle }
    }

    /// Wait for the forwarder to drain; returns the number of lines forwarded.
    pub async fn finish(self) -> usize {
        self.handle.await.unwrap_or(0)
    }
}

/// Sink and forwarder joined by a bounded pipe.
pub fn status_pipe(cancel: CancellationToken, events: Arc<dyn EventSink>) -> (StatusSink, LogForwarder) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (StatusSink::new(tx, cancel), LogForwarder::spawn(rx, events))
}

/// Human readable form of one status line; raw text when it is not a status record.
pub fn render_status_line(line: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let Ok(record) = serde_json::from_str::<PushStatusRecord>(text) else {
        return Some(text.to_string());
    };

    if let Some(failure) = record.failure() {
        return Some(failure);
    }
    if let Some(aux) = &record.aux {
        if let Some(tag) = &aux.tag {
            return Some(format!(
                "{}: digest: {} size: {}",
                tag,
                aux.digest.as_deref().unwrap_or_default(),
                aux.size.unwrap_or_default()
            ));
        }
    }

    let parts: Vec<&str> = [
        record.id.as_deref(),
        record.status.as_deref(),
        record.progress.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect();
    match parts.as_slice() {
        [] => None,
        [id, rest @ ..] if record.id.is_some() && !rest.is_empty() => {
            Some(format!("{}: {}", id, rest.join(" ")))
        }
        _ => Some(parts.join(" ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::events::RecordingEventSink;

    #[test]
    fn test_render_status_line() {
        assert_eq!(
            render_status_line(br#"{"status":"Pushing","id":"abc","progress":"[==>  ]"}"#).as_deref(),
            Some("abc: Pushing [==>  ]")
        );
        assert_eq!(
            render_status_line(br#"{"status":"The push refers to repository [a/b]"}"#).as_deref(),
            Some("The push refers to repository [a/b]")
        );
        assert_eq!(
            render_status_line(br#"{"aux":{"Tag":"v1","Digest":"sha256:aa","Size":12}}"#).as_deref(),
            Some("v1: digest: sha256:aa size: 12")
        );
        assert_eq!(
            render_status_line(br#"{"error":"denied"}"#).as_deref(),
            Some("denied")
        );
        assert_eq!(render_status_line(b"not json").as_deref(), Some("not json"));
        assert_eq!(render_status_line(b"  \n"), None);
        assert_eq!(render_status_line(br#"{"progressDetail":{}}"#), None);
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks_are_reassembled() {
        let events = Arc::new(RecordingEventSink::new());
        let (mut sink, forwarder) = status_pipe(CancellationToken::new(), events.clone());

        sink.write(br#"{"status":"Pus"#).await.unwrap();
        sink.write(b"hing\",\"id\":\"l1\"}\n{\"status\":\"Pushed\",\"id\":\"l1\"}\n").await.unwrap();
        sink.write(b"trailing").await.unwrap();
        sink.close();

        assert_eq!(forwarder.finish().await, 3);
        assert_eq!(events.logs(), vec!["l1: Pushing", "l1: Pushed", "trailing"]);
    }

    #[tokio::test]
    async fn test_cancellation_ends_forwarder() {
        let events = Arc::new(RecordingEventSink::new());
        let cancel = CancellationToken::new();
        let (mut sink, forwarder) = status_pipe(cancel.clone(), events.clone());

        sink.write(b"{\"status\":\"Preparing\",\"id\":\"x\"}\n").await.unwrap();
        cancel.cancel();
        assert!(sink.write(b"more\n").await.is_err());

        // The writer side is closed by the failed write, so this returns.
        forwarder.finish().await;
        assert_eq!(events.logs(), vec!["x: Preparing"]);
    }
}
