//! Subscriber service.
//!
//! A [`Subscriber`] runs one [`SubscriberEngine`] per subscription. Engines
//! share the transport and the local image sink but nothing else.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use framerelay::{ImageStore, Subscriber, SubscriberConfig};
//!
//! # async fn example() -> framerelay::Result<()> {
//! let local = ImageStore::new();
//! let config = SubscriberConfig::default()
//!     .address("camera-host")
//!     .subscribe("cam0/remote_cam0");
//! let subscriber = Subscriber::connect_tcp(config, local.clone())?;
//!
//! // Frames of "cam0" now appear in the local image "remote_cam0".
//!
//! let report = subscriber.shutdown().await?;
//! println!("{:?}", report.streams.get("remote_cam0"));
//! # Ok(())
//! # }
//! ```

pub mod engine;

pub use engine::{ConnectionState, SubscriberEngine, SubscriberSettings, SubscriberStats};

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::codec::{CodecFactory, pixel_codec_factory};
use crate::config::SubscriberConfig;
use crate::reporter::{Reporter, TracingReporter};
use crate::source::ImageSink;
use crate::transport::{ClientTransport, TcpClient};
use crate::worker::WorkerHandle;
use crate::{RelayError, Result};

/// A remote stream and the local image it is written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub remote: String,
    pub local: String,
}

impl Subscription {
    /// Receive `remote` into a local image of the same name.
    pub fn new(remote: impl Into<String>) -> Self {
        let remote = remote.into();
        Self { local: remote.clone(), remote }
    }

    /// Parse `remote[/local]`.
    ///
    /// Only the first `/` separates the parts. An empty local part means the
    /// remote name is used locally.
    pub fn parse(spec: &str) -> Result<Self> {
        let (remote, local) = match spec.split_once('/') {
            Some((remote, local)) => (remote.trim(), local.trim()),
            None => (spec.trim(), ""),
        };
        if remote.is_empty() {
            return Err(RelayError::config(format!("subscription {:?} has no remote stream", spec)));
        }
        let local = if local.is_empty() { remote } else { local };
        Ok(Self { remote: remote.to_string(), local: local.to_string() })
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.remote == self.local {
            write!(f, "{}", self.remote)
        } else {
            write!(f, "{}/{}", self.remote, self.local)
        }
    }
}

/// Optional collaborators of a subscriber.
#[derive(Clone)]
pub struct SubscriberOptions {
    pub reporter: Arc<dyn Reporter>,
    pub codecs: CodecFactory,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self { reporter: Arc::new(TracingReporter), codecs: pixel_codec_factory() }
    }
}

impl std::fmt::Debug for SubscriberOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberOptions").finish_non_exhaustive()
    }
}

/// Statistics of a stopped subscriber, keyed by local image name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriberReport {
    pub streams: BTreeMap<String, SubscriberStats>,
}

struct RunningEngine {
    subscription: Subscription,
    state: watch::Receiver<ConnectionState>,
    worker: WorkerHandle<SubscriberStats>,
}

/// Running subscriber: one engine per subscription.
pub struct Subscriber {
    cancel: CancellationToken,
    engines: BTreeMap<String, RunningEngine>,
}

impl Subscriber {
    /// Connect to the configured publisher over TCP.
    pub fn connect_tcp<K: ImageSink>(config: SubscriberConfig, sink: K) -> Result<Self> {
        let transport = TcpClient::new(config.endpoint());
        Self::start(config, transport, sink)
    }

    /// Start one engine per configured subscription.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C: ClientTransport, K: ImageSink>(
        config: SubscriberConfig,
        transport: C,
        sink: K,
    ) -> Result<Self> {
        Self::start_with(config, transport, sink, SubscriberOptions::default())
    }

    pub fn start_with<C: ClientTransport, K: ImageSink>(
        config: SubscriberConfig,
        transport: C,
        sink: K,
        options: SubscriberOptions,
    ) -> Result<Self> {
        config.validate()?;
        let subscriptions = config
            .subscriptions
            .iter()
            .map(|spec| Subscription::parse(spec))
            .collect::<Result<Vec<_>>>()?;

        let mut seen = std::collections::HashSet::new();
        for subscription in &subscriptions {
            if !seen.insert(subscription.local.as_str()) {
                return Err(RelayError::config(format!(
                    "local image {:?} is the target of more than one subscription",
                    subscription.local
                )));
            }
        }

        let cancel = CancellationToken::new();
        let transport = Arc::new(transport);
        let sink = Arc::new(sink);
        let settings = SubscriberSettings::from(&config);

        let mut engines = BTreeMap::new();
        for subscription in subscriptions {
            let engine = SubscriberEngine::new(
                subscription.clone(),
                Arc::clone(&transport),
                Arc::clone(&sink),
                (options.codecs)(),
                settings,
            )
            .with_reporter(Arc::clone(&options.reporter));
            let state = engine.state();
            let worker = WorkerHandle::spawn(
                format!("subscriber:{}", subscription),
                &cancel,
                |cancel| engine.run(cancel),
            );
            engines.insert(subscription.local.clone(), RunningEngine { subscription, state, worker });
        }

        info!(endpoint = %transport.endpoint(), streams = engines.len(), "Subscriber started");
        Ok(Self { cancel, engines })
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.engines.values().map(|e| e.subscription.clone()).collect()
    }

    /// Current connection state of the engine writing to `local`.
    pub fn state(&self, local: &str) -> Option<ConnectionState> {
        self.engines.get(local).map(|e| *e.state.borrow())
    }

    /// Stream of connection state changes of the engine writing to `local`,
    /// starting with the current state.
    pub fn state_updates(
        &self,
        local: &str,
    ) -> Option<impl Stream<Item = ConnectionState> + Send + Unpin + 'static> {
        self.engines.get(local).map(|e| WatchStream::new(e.state.clone()))
    }

    /// Whether every engine is still running.
    pub fn is_running(&self) -> bool {
        self.engines.values().all(|e| !e.worker.is_finished())
    }

    /// Stop every engine and collect statistics.
    ///
    /// Returns the first engine failure, after all engines have stopped.
    pub async fn shutdown(self) -> Result<SubscriberReport> {
        info!("Subscriber shutting down");
        self.cancel.cancel();

        let mut report = SubscriberReport::default();
        let mut first_error = None;
        for (local, engine) in self.engines {
            match engine.worker.join().await {
                Ok(stats) => {
                    report.streams.insert(local, stats);
                }
                Err(e) => {
                    warn!(local = %local, error = %e, "Subscriber engine failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_parsing() {
        assert_eq!(Subscription::parse("cam0").unwrap(), Subscription::new("cam0"));
        assert_eq!(
            Subscription::parse(" cam0 / local0 ").unwrap(),
            Subscription { remote: "cam0".into(), local: "local0".into() }
        );
        assert_eq!(Subscription::parse("cam0/").unwrap(), Subscription::new("cam0"));
        assert_eq!(Subscription::parse("a/b/c").unwrap().local, "b/c");
        assert!(matches!(Subscription::parse("/local"), Err(RelayError::Config { .. })));
        assert!(Subscription::parse("  ").is_err());
    }

    #[test]
    fn subscription_display() {
        assert_eq!(Subscription::parse("cam0").unwrap().to_string(), "cam0");
        assert_eq!(Subscription::parse("cam0/x").unwrap().to_string(), "cam0/x");
    }

    #[tokio::test]
    async fn duplicate_local_names_are_rejected() {
        let hub = crate::transport::MemoryHub::default();
        let config = SubscriberConfig::default().subscribe("a/x").subscribe("b/x");
        let result = Subscriber::start(config, hub.client(), crate::source::ImageStore::new());
        assert!(matches!(result, Err(RelayError::Config { .. })));
    }
}
