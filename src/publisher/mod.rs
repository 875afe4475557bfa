//! Publisher service.
//!
//! A [`Publisher`] owns one request router plus one [`PublisherEngine`] per
//! served stream, all sharing a single [`DemandTable`] and transport:
//!
//! ```text
//!   subscribers ──requests──> router ──arms──> DemandTable
//!                                                  │ take
//!   ImageSource ──frames──> engine(cam0) ──────────┤
//!                           engine(wfs)  ──────────┘
//!                                 │ try_send (shared Bytes)
//!                                 v
//!                            subscribers
//! ```
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use framerelay::{ImageStore, Publisher, PublisherConfig};
//!
//! # async fn example() -> framerelay::Result<()> {
//! let store = ImageStore::new();
//! let config = PublisherConfig::default().stream("cam0").fps_target(20.0);
//! let publisher = Publisher::bind_tcp(config, store).await?;
//!
//! // ... serve until a signal arrives ...
//!
//! let report = publisher.shutdown().await?;
//! println!("{:?}", report.streams.get("cam0"));
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod router;

pub use engine::{EngineSettings, PublisherEngine, PublisherStats};
pub use router::{RouterStats, run_router};

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{CodecFactory, pixel_codec_factory};
use crate::config::PublisherConfig;
use crate::demand::DemandTable;
use crate::reporter::{Reporter, TracingReporter};
use crate::source::ImageSource;
use crate::transport::{ServerTransport, TcpServer};
use crate::worker::WorkerHandle;
use crate::{RelayError, Result};

/// Broadcast request asking every engine to close and reopen its source.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct SourceResetSignal {
    generation: Arc<watch::Sender<u64>>,
}

impl SourceResetSignal {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self { generation: Arc::new(generation) }
    }

    /// Ask every listening engine to reopen its source.
    pub fn request_reset(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }

    pub fn listener(&self) -> ResetListener {
        ResetListener { generation: self.generation.subscribe() }
    }
}

impl Default for SourceResetSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// One engine's view of a [`SourceResetSignal`].
#[derive(Debug, Clone)]
pub struct ResetListener {
    generation: watch::Receiver<u64>,
}

impl ResetListener {
    /// Whether a reset was requested since the last call.
    pub fn take_request(&mut self) -> bool {
        match self.generation.has_changed() {
            Ok(true) => {
                self.generation.borrow_and_update();
                true
            }
            _ => false,
        }
    }
}

/// Optional collaborators of a publisher.
#[derive(Clone)]
pub struct PublisherOptions {
    pub reporter: Arc<dyn Reporter>,
    pub codecs: CodecFactory,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self { reporter: Arc::new(TracingReporter), codecs: pixel_codec_factory() }
    }
}

impl std::fmt::Debug for PublisherOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherOptions").finish_non_exhaustive()
    }
}

/// Statistics of a stopped publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherReport {
    pub streams: BTreeMap<String, PublisherStats>,
    pub router: RouterStats,
}

impl PublisherReport {
    /// Frames sent over all streams.
    pub fn total_frames_sent(&self) -> u64 {
        self.streams.values().map(|s| s.frames_sent).sum()
    }
}

type Engines = HashMap<String, WorkerHandle<PublisherStats>>;

/// State shared between the publisher handle and its catalog watcher.
struct Shared<S: ImageSource, T: ServerTransport> {
    config: PublisherConfig,
    source: Arc<S>,
    transport: Arc<T>,
    demand: Arc<DemandTable>,
    reset: SourceResetSignal,
    options: PublisherOptions,
    cancel: CancellationToken,
    engines: Mutex<Engines>,
}

impl<S: ImageSource, T: ServerTransport> Shared<S, T> {
    fn engines(&self) -> MutexGuard<'_, Engines> {
        self.engines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_stream(&self, name: &str) -> bool {
        let mut engines = self.engines();
        if engines.get(name).is_some_and(|worker| !worker.is_finished()) {
            return false;
        }

        let engine = PublisherEngine::new(
            name,
            Arc::clone(&self.source),
            Arc::clone(&self.transport),
            Arc::clone(&self.demand),
            (self.options.codecs)(),
            EngineSettings::from(&self.config),
        )
        .with_reporter(Arc::clone(&self.options.reporter))
        .with_reset(self.reset.listener());

        let worker =
            WorkerHandle::spawn(format!("publisher:{}", name), &self.cancel, |cancel| {
                engine.run(cancel)
            });
        if let Some(previous) = engines.insert(name.to_string(), worker) {
            debug!(stream = name, worker = previous.name(), "Replacing finished engine");
        }
        true
    }
}

/// Running publisher: a request router plus one engine per stream.
pub struct Publisher<S: ImageSource, T: ServerTransport> {
    shared: Arc<Shared<S, T>>,
    router: WorkerHandle<RouterStats>,
    catalog: Option<WorkerHandle<()>>,
}

impl<S: ImageSource> Publisher<S, TcpServer> {
    /// Bind a TCP server as configured and start publishing.
    pub async fn bind_tcp(config: PublisherConfig, source: S) -> Result<Self> {
        config.validate()?;
        let addr: SocketAddr = config.listen_address().parse().map_err(|e| {
            RelayError::config(format!("invalid listen address {}: {}", config.listen_address(), e))
        })?;
        let transport = TcpServer::bind(addr, config.send_queue_depth).await?;
        Self::start(config, source, transport)
    }
}

impl<S: ImageSource, T: ServerTransport> Publisher<S, T> {
    /// Start serving the configured streams over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: PublisherConfig, source: S, transport: T) -> Result<Self> {
        Self::start_with(config, source, transport, PublisherOptions::default())
    }

    pub fn start_with(
        config: PublisherConfig,
        source: S,
        transport: T,
        options: PublisherOptions,
    ) -> Result<Self> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let transport = Arc::new(transport);
        let demand = Arc::new(DemandTable::new());

        let router = {
            let transport = Arc::clone(&transport);
            let demand = Arc::clone(&demand);
            WorkerHandle::spawn("router", &cancel, move |cancel| {
                run_router(transport, demand, cancel)
            })
        };

        let shared = Arc::new(Shared {
            config,
            source: Arc::new(source),
            transport,
            demand,
            reset: SourceResetSignal::new(),
            options,
            cancel,
            engines: Mutex::default(),
        });

        for name in shared.config.streams.clone() {
            shared.add_stream(&name);
        }

        let catalog = if shared.config.export_all {
            let watched = Arc::clone(&shared);
            Some(WorkerHandle::spawn("catalog", &shared.cancel, move |cancel| {
                watch_catalog(watched, cancel)
            }))
        } else {
            None
        };

        info!(
            endpoint = %shared.transport.endpoint(),
            streams = shared.config.streams.len(),
            export_all = shared.config.export_all,
            "Publisher started"
        );
        Ok(Self { shared, router, catalog })
    }

    /// Start serving `name`. Returns false if it is already being served.
    pub fn add_stream(&self, name: &str) -> bool {
        self.shared.add_stream(name)
    }

    /// Names of the streams with an engine, sorted.
    pub fn streams(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.engines().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn demand(&self) -> &Arc<DemandTable> {
        &self.shared.demand
    }

    pub fn reset_signal(&self) -> &SourceResetSignal {
        &self.shared.reset
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }

    /// Stop every worker, hang up on waiting subscribers and collect
    /// statistics.
    ///
    /// Every worker is joined even if one failed; the first failure is
    /// returned.
    pub async fn shutdown(self) -> Result<PublisherReport> {
        info!("Publisher shutting down");
        self.shared.cancel.cancel();

        let mut first_error = None;
        if let Some(catalog) = self.catalog {
            if let Err(e) = catalog.join().await {
                first_error.get_or_insert(e);
            }
        }

        let engines: Vec<(String, WorkerHandle<PublisherStats>)> =
            self.shared.engines().drain().collect();
        let mut report = PublisherReport::default();
        for (name, worker) in engines {
            match worker.join().await {
                Ok(stats) => {
                    report.streams.insert(name, stats);
                }
                Err(e) => {
                    warn!(stream = %name, error = %e, "Publisher engine failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match self.router.join().await {
            Ok(stats) => report.router = stats,
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Spawn an engine for every image that appears in the source catalog.
async fn watch_catalog<S: ImageSource, T: ServerTransport>(
    shared: Arc<Shared<S, T>>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ticker = tokio::time::interval(shared.config.catalog_poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        for name in shared.source.list() {
            if shared.add_stream(&name) {
                info!(stream = %name, "Exporting new image stream");
            }
        }
    }
    Ok(())
}
