//! Per-stream publisher engine.
//!
//! One engine serves one image stream. It cycles through
//!
//! ```text
//! Opening -> Streaming -> (ShapeChanged | SourceLost | reset) -> Opening
//! ```
//!
//! until its cancellation token fires, then hangs up on every subscriber still
//! waiting for a frame and returns its statistics.
//!
//! While streaming, a new source frame is encoded only if the rate governor
//! admits it *and* at least one subscriber asked for it. The encoded message
//! is built once and shared between all recipients.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::ResetListener;
use crate::codec::{CodecParams, FrameCodec};
use crate::config::PublisherConfig;
use crate::demand::DemandTable;
use crate::governor::RateGovernor;
use crate::reporter::{Reporter, StreamEvent, TracingReporter};
use crate::source::{ImageSource, SourceHandle};
use crate::transport::{PeerId, SendOutcome, ServerTransport};
use crate::types::{FrameShape, StreamDescriptor};
use crate::wire::{FrameBuffer, FrameHeader, hangup};
use crate::{RelayError, Result};

/// Counters collected by one publisher engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Successful source opens, including reopens.
    pub source_opens: u64,
    /// Messages queued for subscribers.
    pub frames_sent: u64,
    /// New source frames skipped because nobody asked for them.
    pub frames_skipped: u64,
    /// Messages dropped because a subscriber's queue was full.
    pub frames_dropped: u64,
    pub encodes: u64,
    pub evictions: u64,
    pub shape_changes: u64,
    pub source_losses: u64,
    pub hangups_sent: u64,
}

/// Timing and codec settings of an engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineSettings {
    pub fps_target: f64,
    pub fps_gain: f64,
    pub idle_interval: Duration,
    pub open_retry: Duration,
    pub compression: CodecParams,
}

impl From<&PublisherConfig> for EngineSettings {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            fps_target: config.fps_target,
            fps_gain: config.fps_gain,
            idle_interval: config.idle_interval(),
            open_retry: config.open_retry(),
            compression: config.compression,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&PublisherConfig::default())
    }
}

/// Why the streaming loop ended.
enum Transition {
    Reopen,
    Shutdown,
}

/// State that lives for one successful source open.
struct OpenStream<H> {
    handle: H,
    shape: FrameShape,
    params: CodecParams,
    raw: Vec<u8>,
    frame: FrameBuffer,
    governor: RateGovernor,
    last_counter: Option<u64>,
}

/// Serves one stream to every subscriber that asks for it.
pub struct PublisherEngine<S: ImageSource, T: ServerTransport> {
    stream: String,
    source: Arc<S>,
    transport: Arc<T>,
    demand: Arc<DemandTable>,
    codec: Box<dyn FrameCodec>,
    reporter: Arc<dyn Reporter>,
    reset: Option<ResetListener>,
    settings: EngineSettings,
    stats: PublisherStats,
}

impl<S: ImageSource, T: ServerTransport> PublisherEngine<S, T> {
    pub fn new(
        stream: impl Into<String>,
        source: Arc<S>,
        transport: Arc<T>,
        demand: Arc<DemandTable>,
        codec: Box<dyn FrameCodec>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            stream: stream.into(),
            source,
            transport,
            demand,
            codec,
            reporter: Arc::new(TracingReporter),
            reset: None,
            settings,
            stats: PublisherStats::default(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_reset(mut self, reset: ResetListener) -> Self {
        self.reset = Some(reset);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<PublisherStats> {
        info!(stream = %self.stream, "Publisher engine started");

        while let Some(handle) = self.open(&cancel).await {
            let mut open = self.prepare(handle)?;
            match self.stream_frames(&mut open, &cancel).await {
                Transition::Reopen => {
                    debug!(stream = %self.stream, "Closing source for reopen");
                }
                Transition::Shutdown => break,
            }
        }

        let hangups = self.hang_up();
        self.reporter.report(StreamEvent::PublisherStopped { stream: self.stream.clone(), hangups });
        info!(
            stream = %self.stream,
            sent = self.stats.frames_sent,
            skipped = self.stats.frames_skipped,
            "Publisher engine stopped"
        );
        Ok(self.stats)
    }

    /// Open the source, retrying until it appears or shutdown.
    async fn open(&mut self, cancel: &CancellationToken) -> Option<S::Handle> {
        let mut reported_missing = false;
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            // A reset while closed has nothing left to reset.
            self.reset_requested();

            match self.source.open(&self.stream) {
                Ok(handle) => {
                    self.stats.source_opens += 1;
                    return Some(handle);
                }
                Err(RelayError::SourceNotFound { .. }) => {
                    if !reported_missing {
                        reported_missing = true;
                        self.report(StreamEvent::SourceNotFound { stream: self.stream.clone() });
                    }
                }
                Err(RelayError::SourceNotReady { .. }) => {
                    self.report(StreamEvent::SourceNotReady { stream: self.stream.clone() });
                }
                Err(e) if e.is_retryable() => {
                    debug!(stream = %self.stream, error = %e, "Image stream not openable yet");
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Failed to open image stream");
                }
            }

            if sleep_or_cancel(self.settings.open_retry, cancel).await {
                return None;
            }
        }
    }

    /// Configure the codec and buffers for a freshly opened source.
    fn prepare(&mut self, handle: S::Handle) -> Result<OpenStream<S::Handle>> {
        let shape = handle.status().shape;
        let params = self.settings.compression.effective_for(shape.element_type);
        self.codec.configure(shape, params)?;
        let frame = FrameBuffer::with_payload_capacity(self.codec.max_output_size());

        self.report(StreamEvent::SourceOpened { stream: self.stream.clone(), shape });
        debug!(stream = %self.stream, ?params, "Codec configured");

        Ok(OpenStream {
            handle,
            shape,
            params,
            raw: vec![0u8; shape.slice_len()],
            frame,
            governor: RateGovernor::new(
                self.settings.fps_target,
                self.settings.fps_gain,
                Instant::now(),
            ),
            last_counter: None,
        })
    }

    async fn stream_frames(
        &mut self,
        open: &mut OpenStream<S::Handle>,
        cancel: &CancellationToken,
    ) -> Transition {
        loop {
            if cancel.is_cancelled() {
                return Transition::Shutdown;
            }
            if self.reset_requested() {
                self.report(StreamEvent::SourceReset { stream: self.stream.clone() });
                return Transition::Reopen;
            }

            let status = open.handle.status();
            if !status.semaphore_valid {
                self.stats.source_losses += 1;
                self.report(StreamEvent::SourceLost { stream: self.stream.clone() });
                return Transition::Reopen;
            }

            if open.last_counter == Some(status.frame_counter) {
                open.governor.relax_if_stalled(Instant::now());
                if sleep_or_cancel(self.settings.idle_interval, cancel).await {
                    return Transition::Shutdown;
                }
                continue;
            }

            let now = Instant::now();
            if !open.governor.admit(now) {
                if sleep_or_cancel(self.settings.idle_interval, cancel).await {
                    return Transition::Shutdown;
                }
                continue;
            }

            let peers = self.demand.take_pending(&self.stream);
            if peers.is_empty() {
                trace!(stream = %self.stream, counter = status.frame_counter, "No demand, frame skipped");
                self.stats.frames_skipped += 1;
                open.last_counter = Some(status.frame_counter);
                open.governor.relax_if_stalled(now);
                continue;
            }

            match self.dispatch(open, &peers) {
                Ok(counter) => {
                    open.governor.record_send(Instant::now());
                    open.last_counter = Some(counter);
                }
                Err(e) => {
                    self.rearm(&peers);
                    match e {
                        RelayError::ShapeChanged { .. } => {}
                        RelayError::SourceLost { .. } => {
                            self.stats.source_losses += 1;
                            self.report(StreamEvent::SourceLost { stream: self.stream.clone() });
                        }
                        other => {
                            warn!(stream = %self.stream, error = %other, "Frame dispatch failed");
                        }
                    }
                    return Transition::Reopen;
                }
            }
        }
    }

    /// Encode the current slice once and queue it for every peer.
    ///
    /// Returns the frame counter that was sent.
    fn dispatch(&mut self, open: &mut OpenStream<S::Handle>, peers: &[PeerId]) -> Result<u64> {
        let status = open.handle.status();
        if status.shape != open.shape {
            self.stats.shape_changes += 1;
            self.report(StreamEvent::ShapeChanged {
                stream: self.stream.clone(),
                from: open.shape,
                to: status.shape,
            });
            return Err(RelayError::ShapeChanged { name: self.stream.clone() });
        }

        open.handle.read_slice(status.current_slot(), &mut open.raw)?;
        let payload_len = self.codec.encode(&open.raw, open.frame.payload_mut())?;
        self.stats.encodes += 1;

        let header = FrameHeader::new(
            StreamDescriptor {
                name: self.stream.clone(),
                width: open.shape.width,
                height: open.shape.height,
                element_type: open.shape.element_type,
                frame_counter: status.frame_counter,
                timestamp: status.timestamp,
            },
            open.params,
            u32::try_from(payload_len)
                .map_err(|_| RelayError::codec(format!("payload of {} bytes", payload_len)))?,
        );
        let message = open.frame.finish(&header)?;

        for &peer in peers {
            match self.transport.try_send(peer, message.clone()) {
                SendOutcome::Sent => {
                    self.stats.frames_sent += 1;
                }
                SendOutcome::WouldBlock => {
                    trace!(stream = %self.stream, peer, "Subscriber queue full, frame dropped");
                    self.stats.frames_dropped += 1;
                }
                SendOutcome::PeerGone => {
                    self.demand.evict(peer);
                    self.stats.evictions += 1;
                    self.report(StreamEvent::PeerEvicted { stream: self.stream.clone(), peer });
                }
            }
        }
        trace!(
            stream = %self.stream,
            counter = status.frame_counter,
            peers = peers.len(),
            bytes = message.len(),
            "Frame dispatched"
        );
        Ok(status.frame_counter)
    }

    fn rearm(&self, peers: &[PeerId]) {
        for &peer in peers {
            self.demand.mark_pending(peer, &self.stream);
        }
    }

    /// Send the hangup sentinel to every subscriber still waiting.
    fn hang_up(&mut self) -> usize {
        let mut sent = 0;
        for peer in self.demand.take_pending(&self.stream) {
            if self.transport.try_send(peer, hangup()) == SendOutcome::Sent {
                sent += 1;
            }
        }
        self.stats.hangups_sent += sent as u64;
        sent
    }

    fn reset_requested(&mut self) -> bool {
        self.reset.as_mut().is_some_and(|r| r.take_request())
    }

    fn report(&self, event: StreamEvent) {
        self.reporter.report(event);
    }
}

/// Sleep unless cancelled first. Returns whether cancellation fired.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}
