//! Per-stream subscriber engine.
//!
//! ```text
//! Disconnected -> AwaitingFirstFrame -> Connected -> Disconnected
//! ```
//!
//! The engine pulls frames: it sends one request, waits for one frame, writes
//! it into the local sink and only then asks for the next one. At most one
//! frame is ever in flight per stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::Subscription;
use crate::codec::FrameCodec;
use crate::config::SubscriberConfig;
use crate::publisher::engine::sleep_or_cancel;
use crate::reporter::{Reporter, StreamEvent, TracingReporter};
use crate::source::{ImageSink, SinkHandle};
use crate::transport::{ClientTransport, Connection};
use crate::types::FrameShape;
use crate::wire::{WireFrame, is_hangup};
use crate::{RelayError, Result};

/// Connection state of one subscribed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Request sent, no frame received on this connection yet.
    AwaitingFirstFrame,
    Connected,
}

/// Counters collected by one subscriber engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    pub connects: u64,
    pub frames_received: u64,
    pub sinks_created: u64,
    /// Sink recreations caused by a shape change.
    pub sink_rebuilds: u64,
    /// Requests re-sent after a receive timeout.
    pub keepalives: u64,
    pub disconnects: u64,
    pub hangups: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberSettings {
    pub receive_timeout: Duration,
    pub reconnect_pause: Duration,
}

impl From<&SubscriberConfig> for SubscriberSettings {
    fn from(config: &SubscriberConfig) -> Self {
        Self {
            receive_timeout: config.receive_timeout(),
            reconnect_pause: config.reconnect_pause(),
        }
    }
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self::from(&SubscriberConfig::default())
    }
}

/// How a receive session ended.
enum Session {
    Lost(String),
    Shutdown,
}

/// Receives one remote stream into one local sink.
pub struct SubscriberEngine<C: ClientTransport, K: ImageSink> {
    subscription: Subscription,
    transport: Arc<C>,
    sink: Arc<K>,
    codec: Box<dyn FrameCodec>,
    reporter: Arc<dyn Reporter>,
    settings: SubscriberSettings,
    state: watch::Sender<ConnectionState>,
    local: Option<K::Handle>,
    pixels: Vec<u8>,
    stats: SubscriberStats,
}

impl<C: ClientTransport, K: ImageSink> SubscriberEngine<C, K> {
    pub fn new(
        subscription: Subscription,
        transport: Arc<C>,
        sink: Arc<K>,
        codec: Box<dyn FrameCodec>,
        settings: SubscriberSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            subscription,
            transport,
            sink,
            codec,
            reporter: Arc::new(TracingReporter),
            settings,
            state,
            local: None,
            pixels: Vec::new(),
            stats: SubscriberStats::default(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Receiver following the engine's connection state.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run until `cancel` fires or a fatal transport error occurs.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<SubscriberStats> {
        info!(
            stream = %self.subscription.remote,
            local = %self.subscription.local,
            endpoint = %self.transport.endpoint(),
            "Subscriber engine started"
        );

        let result = self.receive_until_cancelled(&cancel).await;

        self.set_state(ConnectionState::Disconnected);
        // Destroy the local image before reporting the stop.
        self.local = None;
        self.reporter.report(StreamEvent::SubscriberStopped {
            stream: self.subscription.remote.clone(),
        });

        match result {
            Ok(()) => {
                info!(
                    stream = %self.subscription.remote,
                    frames = self.stats.frames_received,
                    "Subscriber engine stopped"
                );
                Ok(self.stats)
            }
            Err(e) => {
                error!(stream = %self.subscription.remote, error = %e, "Subscriber engine failed");
                Err(e)
            }
        }
    }

    async fn receive_until_cancelled(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let Some(mut connection) = self.connect(cancel).await else {
                return Ok(());
            };

            let session = self.receive(&mut connection, cancel).await;
            drop(connection);
            match session {
                Ok(Session::Shutdown) => return Ok(()),
                Ok(Session::Lost(reason)) => {
                    self.stats.disconnects += 1;
                    self.set_state(ConnectionState::Disconnected);
                    self.reporter.report(StreamEvent::Disconnected {
                        stream: self.subscription.remote.clone(),
                        reason,
                    });
                    if sleep_or_cancel(self.settings.reconnect_pause, cancel).await {
                        return Ok(());
                    }
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        debug!(stream = %self.subscription.remote, error = %e, "Receive failed during shutdown");
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Connect and send the first request, retrying after the reconnect
    /// pause until it works or shutdown.
    async fn connect(&mut self, cancel: &CancellationToken) -> Option<C::Connection> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                attempt = self.transport.connect() => attempt,
            };
            match attempt {
                Ok(mut connection) => {
                    let request = self.request();
                    let sent = connection.send(request).await;
                    match sent {
                        Ok(()) => {
                            self.stats.connects += 1;
                            self.set_state(ConnectionState::AwaitingFirstFrame);
                            self.reporter.report(StreamEvent::Connected {
                                stream: self.subscription.remote.clone(),
                                endpoint: self.transport.endpoint(),
                            });
                            return Some(connection);
                        }
                        Err(e) => {
                            warn!(stream = %self.subscription.remote, error = %e, "Failed to send request");
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        stream = %self.subscription.remote,
                        endpoint = %self.transport.endpoint(),
                        error = %e,
                        "Connect failed, retrying"
                    );
                }
            }

            if sleep_or_cancel(self.settings.reconnect_pause, cancel).await {
                return None;
            }
        }
    }

    async fn receive(
        &mut self,
        connection: &mut C::Connection,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return Ok(Session::Shutdown),
                received = connection.recv(self.settings.receive_timeout) => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.stats.keepalives += 1;
                    trace!(stream = %self.subscription.remote, "Receive timed out, re-sending request");
                    let request = self.request();
                    if let Some(session) = send_request(connection, request).await? {
                        return Ok(session);
                    }
                    continue;
                }
                Err(e) if e.is_disconnect() => return Ok(Session::Lost(e.to_string())),
                Err(e) => return Err(e),
            };

            if is_hangup(&message) {
                self.stats.hangups += 1;
                return Ok(Session::Lost("publisher hung up".to_string()));
            }
            match self.handle_frame(message) {
                Ok(()) => {}
                Err(e) if e.is_disconnect() => return Ok(Session::Lost(e.to_string())),
                Err(e) => return Err(e),
            }

            let request = self.request();
            if let Some(session) = send_request(connection, request).await? {
                return Ok(session);
            }
        }
    }

    /// Decode one frame into the local sink.
    ///
    /// Nothing is written unless the whole frame decodes.
    fn handle_frame(&mut self, message: Bytes) -> Result<()> {
        let frame = WireFrame::parse(message)?;
        let shape = frame.header.descriptor.shape();
        let params = frame.header.params;

        if self.codec.shape() != Some(shape) || self.codec.params() != params {
            debug!(stream = %self.subscription.remote, %shape, ?params, "Configuring decoder");
            self.codec.configure(shape, params)?;
        }
        self.pixels.resize(shape.slice_len(), 0);
        self.codec.decode(&frame.payload, &mut self.pixels)?;

        self.ensure_sink(shape)?;
        let Some(local) = self.local.as_mut() else {
            return Err(RelayError::worker(self.subscription.remote.clone(), "local image missing"));
        };
        local.write_slice(
            &self.pixels,
            frame.header.descriptor.frame_counter,
            frame.header.descriptor.timestamp,
        )?;
        local.notify_readers();

        self.stats.frames_received += 1;
        self.set_state(ConnectionState::Connected);
        trace!(
            stream = %self.subscription.remote,
            counter = frame.header.descriptor.frame_counter,
            "Frame received"
        );
        Ok(())
    }

    /// Make sure the local sink exists with the slice layout of `shape`.
    fn ensure_sink(&mut self, shape: FrameShape) -> Result<()> {
        let stale = self.local.as_ref().map(|local| !local.shape().same_slice_layout(&shape));
        if stale != Some(false) {
            if stale == Some(true) {
                self.stats.sink_rebuilds += 1;
            }
            // The old image must be gone before one of the same name is created.
            self.local = None;
            let created = self.sink.create(&self.subscription.local, shape)?;
            self.stats.sinks_created += 1;
            self.reporter.report(StreamEvent::SinkCreated {
                stream: self.subscription.remote.clone(),
                sink: self.subscription.local.clone(),
                shape,
            });
            self.local = Some(created);
        }
        Ok(())
    }

    fn request(&self) -> Bytes {
        Bytes::from(self.subscription.remote.clone())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            trace!(stream = %self.subscription.remote, from = ?*current, to = ?state, "State change");
            *current = state;
            true
        });
    }
}

/// Send the request message. A disconnect ends the session.
async fn send_request<N: Connection>(connection: &mut N, request: Bytes) -> Result<Option<Session>> {
    match connection.send(request).await {
        Ok(()) => Ok(None),
        Err(e) if e.is_disconnect() => Ok(Some(Session::Lost(e.to_string()))),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecParams, PixelCodec};
    use crate::source::{ImageStore, SourceHandle};
    use crate::test_utils::{
        RecordingReporter, counting_codecs, encode_frame, ramp_frame, small_u8_shape, u16_shape,
        within,
    };
    use crate::transport::{MemoryClient, MemoryHub, PeerId, SendOutcome, ServerEvent, ServerTransport};
    use crate::types::{ElementType, StreamDescriptor, Timestamp};
    use crate::wire::{FrameHeader, HEADER_SIZE, hangup};
    use tokio::task::JoinHandle;

    const PATIENCE: Duration = Duration::from_secs(5);

    fn fast() -> SubscriberSettings {
        SubscriberSettings {
            receive_timeout: Duration::from_secs(2),
            reconnect_pause: Duration::from_millis(5),
        }
    }

    struct Harness {
        hub: MemoryHub,
        local: ImageStore,
        reporter: RecordingReporter,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                hub: MemoryHub::default(),
                local: ImageStore::new(),
                reporter: RecordingReporter::new(),
                cancel: CancellationToken::new(),
            }
        }

        fn engine(
            &self,
            spec: &str,
            settings: SubscriberSettings,
        ) -> SubscriberEngine<MemoryClient, ImageStore> {
            SubscriberEngine::new(
                Subscription::parse(spec).unwrap(),
                Arc::new(self.hub.client()),
                Arc::new(self.local.clone()),
                Box::new(PixelCodec::new()),
                settings,
            )
            .with_reporter(Arc::new(self.reporter.clone()))
        }

        fn spawn(
            &self,
            engine: SubscriberEngine<MemoryClient, ImageStore>,
        ) -> JoinHandle<Result<SubscriberStats>> {
            tokio::spawn(engine.run(self.cancel.clone()))
        }

        /// Wait for the next request, acting as the publisher.
        ///
        /// Disconnect notices are skipped.
        async fn request(&self) -> (PeerId, String) {
            loop {
                let event = within(PATIENCE, "request", self.hub.recv()).await.unwrap();
                if let ServerEvent::Request { peer, message } = event {
                    return (peer, String::from_utf8(message.to_vec()).unwrap());
                }
            }
        }

        fn send(&self, peer: PeerId, message: Bytes) {
            assert_eq!(self.hub.try_send(peer, message), SendOutcome::Sent);
        }

        async fn stop(&self, task: JoinHandle<Result<SubscriberStats>>) -> SubscriberStats {
            self.cancel.cancel();
            within(PATIENCE, "engine shutdown", task).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn frames_are_written_and_the_next_one_requested() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));

        let (peer, stream) = harness.request().await;
        assert_eq!(stream, "cam0");

        let shape = u16_shape();
        let raw = ramp_frame(shape, 4);
        harness.send(peer, encode_frame("cam0", shape, 41, CodecParams::default(), &raw).unwrap());

        // The next request only comes after the frame was written.
        let (again, stream) = harness.request().await;
        assert_eq!((again, stream.as_str()), (peer, "cam0"));

        let reader = harness.local.open("cam0").unwrap();
        let status = reader.status();
        assert_eq!(status.shape, shape);
        assert_eq!(status.frame_counter, 41);
        assert_eq!(status.timestamp, Timestamp::new(41, 500));
        assert_eq!(reader.latest(), raw);

        let stats = harness.stop(task).await;
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.sinks_created, 1);
        assert_eq!(stats.sink_rebuilds, 0);
        // The local image goes away with the engine.
        assert!(!harness.local.contains("cam0"));
    }

    #[tokio::test]
    async fn local_name_maps_the_sink() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0/mirror", fast()));

        let (peer, stream) = harness.request().await;
        assert_eq!(stream, "cam0");
        let shape = small_u8_shape();
        harness.send(peer, encode_frame("cam0", shape, 1, CodecParams::none(), &ramp_frame(shape, 0)).unwrap());
        harness.request().await;

        assert!(harness.local.contains("mirror"));
        assert!(!harness.local.contains("cam0"));
        assert!(harness.reporter.events().contains(&StreamEvent::SinkCreated {
            stream: "cam0".into(),
            sink: "mirror".into(),
            shape,
        }));
        harness.stop(task).await;
    }

    #[tokio::test]
    async fn shape_change_recreates_the_sink_once() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));

        let narrow = FrameShape::new(64, 32, ElementType::UInt16);
        let wide = FrameShape::new(128, 32, ElementType::UInt16);

        let (peer, _) = harness.request().await;
        harness.send(peer, encode_frame("cam0", narrow, 1, CodecParams::default(), &ramp_frame(narrow, 1)).unwrap());
        harness.request().await;
        harness.send(peer, encode_frame("cam0", narrow, 2, CodecParams::default(), &ramp_frame(narrow, 2)).unwrap());
        harness.request().await;

        let raw = ramp_frame(wide, 3);
        harness.send(peer, encode_frame("cam0", wide, 3, CodecParams::default(), &raw).unwrap());
        harness.request().await;

        let reader = harness.local.open("cam0").unwrap();
        assert_eq!(reader.status().shape, wide);
        assert_eq!(reader.latest(), raw);

        let stats = harness.stop(task).await;
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.sinks_created, 2);
        assert_eq!(stats.sink_rebuilds, 1);
    }

    #[tokio::test]
    async fn decoder_follows_the_sender_parameters() {
        let harness = Harness::new();
        let (codecs, counters) = counting_codecs();
        let engine = SubscriberEngine::new(
            Subscription::new("cam0"),
            Arc::new(harness.hub.client()),
            Arc::new(harness.local.clone()),
            codecs(),
            fast(),
        );
        let task = harness.spawn(engine);

        let shape = u16_shape();
        let (peer, _) = harness.request().await;
        for (counter, params) in [(1, CodecParams::default()), (2, CodecParams::none())] {
            let raw = ramp_frame(shape, counter);
            harness.send(peer, encode_frame("cam0", shape, counter, params, &raw).unwrap());
            harness.request().await;
            assert_eq!(harness.local.open("cam0").unwrap().latest(), raw);
        }

        let stats = harness.stop(task).await;
        assert_eq!(counters.decodes(), 2);
        assert_eq!(stats.sinks_created, 1);
    }

    #[tokio::test]
    async fn hangup_triggers_reconnect() {
        let harness = Harness::new();
        let engine = harness.engine("cam0", fast());
        let mut state = engine.state();
        let task = harness.spawn(engine);

        let (first, _) = harness.request().await;
        assert_eq!(*state.borrow_and_update(), ConnectionState::AwaitingFirstFrame);
        let shape = small_u8_shape();
        harness.send(first, encode_frame("cam0", shape, 1, CodecParams::none(), &ramp_frame(shape, 1)).unwrap());
        harness.request().await;
        assert_eq!(*state.borrow_and_update(), ConnectionState::Connected);

        harness.send(first, hangup());
        let (second, stream) = harness.request().await;
        assert_ne!(second, first);
        assert_eq!(stream, "cam0");

        let stats = harness.stop(task).await;
        assert_eq!(stats.hangups, 1);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.connects, 2);
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);
        // The sink survives the reconnect until the engine stops.
        assert_eq!(harness.reporter.count(|e| matches!(e, StreamEvent::SinkCreated { .. })), 1);
    }

    #[tokio::test]
    async fn undersized_messages_write_nothing() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));

        let (first, _) = harness.request().await;
        harness.send(first, Bytes::from(vec![7u8; HEADER_SIZE - 1]));
        let (second, _) = harness.request().await;
        assert_ne!(second, first);
        assert!(!harness.local.contains("cam0"));

        let stats = harness.stop(task).await;
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.hangups, 1);
    }

    #[tokio::test]
    async fn malformed_frames_write_nothing() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));
        let shape = u16_shape();

        // Unknown element type code.
        let (first, _) = harness.request().await;
        let mut bad_type =
            encode_frame("cam0", shape, 1, CodecParams::none(), &ramp_frame(shape, 1)).unwrap().to_vec();
        bad_type[crate::wire::header::ELEMENT_TYPE_OFFSET] = 200;
        harness.send(first, Bytes::from(bad_type));

        // Payload that does not decompress.
        let (second, _) = harness.request().await;
        assert_ne!(second, first);
        let mut corrupt =
            encode_frame("cam0", shape, 2, CodecParams::default(), &ramp_frame(shape, 2)).unwrap().to_vec();
        for byte in &mut corrupt[HEADER_SIZE..] {
            *byte = 0xa5;
        }
        harness.send(second, Bytes::from(corrupt));

        let (third, _) = harness.request().await;
        assert_ne!(third, second);
        assert!(!harness.local.contains("cam0"));

        let stats = harness.stop(task).await;
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.disconnects, 2);
        assert_eq!(stats.hangups, 0);
    }

    #[tokio::test]
    async fn oversized_header_shapes_reconnect() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));

        let header = FrameHeader::new(
            StreamDescriptor {
                name: "cam0".into(),
                width: u32::MAX,
                height: u32::MAX,
                element_type: ElementType::UInt16,
                frame_counter: 1,
                timestamp: Timestamp::new(1, 0),
            },
            CodecParams::none(),
            0,
        );
        let (first, _) = harness.request().await;
        harness.send(first, Bytes::copy_from_slice(&header.encode()));

        let (second, stream) = harness.request().await;
        assert_ne!(second, first);
        assert_eq!(stream, "cam0");
        assert!(!harness.local.contains("cam0"));

        // The engine is still alive and serves the next valid frame.
        let shape = small_u8_shape();
        let raw = ramp_frame(shape, 5);
        harness.send(second, encode_frame("cam0", shape, 2, CodecParams::none(), &raw).unwrap());
        harness.request().await;
        assert_eq!(harness.local.open("cam0").unwrap().latest(), raw);

        let stats = harness.stop(task).await;
        assert_eq!(stats.disconnects, 1);
        assert_eq!(stats.frames_received, 1);
    }

    #[tokio::test]
    async fn silence_re_sends_the_request() {
        let harness = Harness::new();
        let settings = SubscriberSettings { receive_timeout: Duration::from_millis(20), ..fast() };
        let task = harness.spawn(harness.engine("cam0", settings));

        let (first, _) = harness.request().await;
        let (again, stream) = harness.request().await;
        assert_eq!(again, first);
        assert_eq!(stream, "cam0");

        let stats = harness.stop(task).await;
        assert!(stats.keepalives >= 1);
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.disconnects, 0);
    }

    #[tokio::test]
    async fn vanished_publisher_is_reconnected() {
        let harness = Harness::new();
        let task = harness.spawn(harness.engine("cam0", fast()));

        let (first, _) = harness.request().await;
        harness.hub.disconnect_all();
        let (second, _) = harness.request().await;
        assert_ne!(second, first);

        let stats = harness.stop(task).await;
        assert_eq!(stats.disconnects, 1);
        assert!(harness.reporter.events().iter().any(|e| matches!(e, StreamEvent::Disconnected { .. })));
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_receive() {
        let harness = Harness::new();
        let settings = SubscriberSettings { receive_timeout: Duration::from_secs(60), ..fast() };
        let task = harness.spawn(harness.engine("cam0", settings));
        harness.request().await;

        let stats = harness.stop(task).await;
        assert_eq!(stats.connects, 1);
        assert!(harness.reporter.events().contains(&StreamEvent::SubscriberStopped { stream: "cam0".into() }));
    }
}
