//! Lifecycle event reporting.
//!
//! Engines describe what happens to their stream through [`StreamEvent`]s
//! handed to an injected [`Reporter`]. The default [`TracingReporter`] turns
//! them into log lines; applications can forward them to a status display or
//! a monitoring system instead.

use crate::transport::PeerId;
use crate::types::FrameShape;
use tracing::{debug, info, warn};

/// Something noteworthy that happened to one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The source does not exist. Reported once per outage.
    SourceNotFound { stream: String },
    /// The source exists but is not initialized yet.
    SourceNotReady { stream: String },
    SourceOpened { stream: String, shape: FrameShape },
    ShapeChanged { stream: String, from: FrameShape, to: FrameShape },
    /// The producer crashed or removed the image.
    SourceLost { stream: String },
    /// An external reset forced the source to be reopened.
    SourceReset { stream: String },
    PeerEvicted { stream: String, peer: PeerId },
    PublisherStopped { stream: String, hangups: usize },
    Connected { stream: String, endpoint: String },
    SinkCreated { stream: String, sink: String, shape: FrameShape },
    Disconnected { stream: String, reason: String },
    SubscriberStopped { stream: String },
}

impl StreamEvent {
    /// The remote stream the event belongs to.
    pub fn stream(&self) -> &str {
        match self {
            StreamEvent::SourceNotFound { stream }
            | StreamEvent::SourceNotReady { stream }
            | StreamEvent::SourceOpened { stream, .. }
            | StreamEvent::ShapeChanged { stream, .. }
            | StreamEvent::SourceLost { stream }
            | StreamEvent::SourceReset { stream }
            | StreamEvent::PeerEvicted { stream, .. }
            | StreamEvent::PublisherStopped { stream, .. }
            | StreamEvent::Connected { stream, .. }
            | StreamEvent::SinkCreated { stream, .. }
            | StreamEvent::Disconnected { stream, .. }
            | StreamEvent::SubscriberStopped { stream } => stream,
        }
    }
}

/// Receiver of stream lifecycle events.
pub trait Reporter: Send + Sync + 'static {
    fn report(&self, event: StreamEvent);
}

/// Reporter that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: StreamEvent) {
        match event {
            StreamEvent::SourceNotFound { stream } => {
                warn!(stream = %stream, "Image stream not found, waiting for it to appear");
            }
            StreamEvent::SourceNotReady { stream } => {
                debug!(stream = %stream, "Image stream not initialized yet");
            }
            StreamEvent::SourceOpened { stream, shape } => {
                info!(stream = %stream, %shape, "Connected to image stream");
            }
            StreamEvent::ShapeChanged { stream, from, to } => {
                info!(stream = %stream, %from, %to, "Image stream changed shape");
            }
            StreamEvent::SourceLost { stream } => {
                warn!(stream = %stream, "Image stream lost, reopening");
            }
            StreamEvent::SourceReset { stream } => {
                info!(stream = %stream, "Image stream reset requested");
            }
            StreamEvent::PeerEvicted { stream, peer } => {
                debug!(stream = %stream, peer, "Subscriber evicted");
            }
            StreamEvent::PublisherStopped { stream, hangups } => {
                info!(stream = %stream, hangups, "Stopped publishing");
            }
            StreamEvent::Connected { stream, endpoint } => {
                info!(stream = %stream, endpoint = %endpoint, "Receiving stream");
            }
            StreamEvent::SinkCreated { stream, sink, shape } => {
                info!(stream = %stream, sink = %sink, %shape, "Local image created");
            }
            StreamEvent::Disconnected { stream, reason } => {
                warn!(stream = %stream, reason = %reason, "Disconnected from publisher");
            }
            StreamEvent::SubscriberStopped { stream } => {
                info!(stream = %stream, "Stopped receiving");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementType;

    #[test]
    fn every_event_names_its_stream() {
        let shape = FrameShape::new(2, 2, ElementType::UInt8);
        let events = [
            StreamEvent::SourceNotFound { stream: "a".into() },
            StreamEvent::ShapeChanged { stream: "a".into(), from: shape, to: shape },
            StreamEvent::PeerEvicted { stream: "a".into(), peer: 1 },
            StreamEvent::SinkCreated { stream: "a".into(), sink: "b".into(), shape },
        ];
        for event in events {
            assert_eq!(event.stream(), "a");
            TracingReporter.report(event);
        }
    }
}
