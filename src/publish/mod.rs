//! Tag-and-push orchestration

pub mod cleanup;
pub mod events;
pub mod publisher;
pub mod stream;
pub mod tags;

pub use cleanup::{Release, ReleaseList};
pub use events::{ConsoleEventSink, EventSink, PublishEvent, RecordingEventSink};
pub use publisher::{PublishReport, Publisher, PublisherBuilder, TagReport};
pub use stream::{LogForwarder, status_pipe};
pub use tags::build_tags;
