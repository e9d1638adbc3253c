//! Pipeline-visible publish events

use crate::output::OutputManager;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishEvent {
    /// One rendered line of push progress
    Log(String),
    Pushed {
        repository: String,
        tag: String,
        digest: Option<String>,
    },
    Failed { message: String },
}

impl fmt::Display for PublishEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishEvent::Log(line) => f.write_str(line),
            PublishEvent::Pushed { repository, tag, .. } => write!(f, "Pushed {}:{}", repository, tag),
            PublishEvent::Failed { message } => write!(f, "Failed to push: {}", message),
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PublishEvent);
}

/// Prints events through the run's [`OutputManager`].
pub struct ConsoleEventSink {
    output: OutputManager,
}

impl ConsoleEventSink {
    pub fn new(output: OutputManager) -> Self {
        Self { output }
    }
}

impl EventSink for ConsoleEventSink {
    fn emit(&self, event: PublishEvent) {
        match &event {
            PublishEvent::Log(line) => self.output.info(line),
            PublishEvent::Pushed { digest, .. } => {
                self.output.success(&event.to_string());
                if let Some(digest) = digest {
                    self.output.detail(&format!("Digest: {}", digest));
                }
            }
            PublishEvent::Failed { .. } => self.output.error(&event.to_string()),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<PublishEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PublishEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// `repository:tag` of every push event, in order
    pub fn pushed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PublishEvent::Pushed { repository, tag, .. } => Some(format!("{}:{}", repository, tag)),
                _ => None,
            })
            .collect()
    }

    pub fn failures(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PublishEvent::Failed { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn logs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PublishEvent::Log(line) => Some(line),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: PublishEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
