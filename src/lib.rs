//! Rate-limited distribution of shared-memory image streams.
//!
//! A framerelay publisher watches named image streams, the ring buffers a
//! camera or simulation process writes frames into, and sends each new
//! frame to every remote subscriber that asked for it. Subscribers write the
//! received frames into local images of their own, so consumers on another
//! host read them exactly like a local camera.
//!
//! # Features
//!
//! - **Pull protocol**: a subscriber has at most one outstanding request per
//!   stream, so a slow consumer throttles only itself
//! - **No wasted work**: frames nobody asked for are never encoded
//! - **Rate governor**: a closed-loop integrator holds the average send rate
//!   at a configured target
//! - **Compression**: 16-bit images are differenced, byte-packed and
//!   compressed; the method codes travel with every frame
//! - **Recovery**: producers restarting, images changing shape and
//!   publishers going away are all handled without operator action
//!
//! ## Example
//!
//! ```rust,no_run
//! use framerelay::{ImageStore, Publisher, PublisherConfig, Subscriber, SubscriberConfig};
//!
//! #[tokio::main]
//! async fn main() -> framerelay::Result<()> {
//!     let cameras = ImageStore::new();
//!     let publisher =
//!         Publisher::bind_tcp(PublisherConfig::default().stream("cam0"), cameras.clone()).await?;
//!
//!     let local = ImageStore::new();
//!     let subscriber = Subscriber::connect_tcp(
//!         SubscriberConfig::default().subscribe("cam0/cam0_remote"),
//!         local.clone(),
//!     )?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     subscriber.shutdown().await?;
//!     publisher.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod demand;
mod error;
pub mod governor;
pub mod publisher;
pub mod reporter;
pub mod source;
pub mod subscriber;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod wire;
pub mod worker;

pub use error::*;

pub use codec::{CodecParams, CompressMethod, DifferenceMethod, FrameCodec, PixelCodec, ReorderMethod};
pub use config::{PublisherConfig, SubscriberConfig};
pub use demand::DemandTable;
pub use governor::RateGovernor;
pub use publisher::{Publisher, PublisherOptions, PublisherReport, PublisherStats, SourceResetSignal};
pub use reporter::{Reporter, StreamEvent, TracingReporter};
pub use source::{ImageReader, ImageSink, ImageSource, ImageStore, ImageWriter};
pub use subscriber::{
    ConnectionState, Subscriber, SubscriberOptions, SubscriberReport, SubscriberStats, Subscription,
};
pub use transport::{MemoryHub, TcpClient, TcpServer};
pub use types::{ElementType, FrameShape, StreamDescriptor, Timestamp};
pub use wire::{FrameHeader, WireFrame};
