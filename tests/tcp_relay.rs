//! End-to-end relay over localhost TCP.
//!
//! A publisher serves an in-process image store through a real TCP server and
//! a subscriber mirrors it into a second store.

use std::time::Duration;

use anyhow::{Context, Result, ensure};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use framerelay::source::SourceHandle;
use framerelay::{
    ConnectionState, ElementType, FrameShape, ImageStore, ImageWriter, Publisher, PublisherConfig,
    Subscriber, SubscriberConfig, TcpClient, TcpServer,
};

const PATIENCE: Duration = Duration::from_secs(10);

fn camera_shape() -> FrameShape {
    FrameShape::new(64, 48, ElementType::UInt16)
}

fn frame(shape: FrameShape, seed: u16) -> Vec<u8> {
    (0..shape.pixels())
        .flat_map(|i| 1000u16.wrapping_add(i as u16).wrapping_add(seed.wrapping_mul(7)).to_le_bytes())
        .collect()
}

async fn publish(
    config: PublisherConfig,
    store: ImageStore,
) -> Result<(Publisher<ImageStore, TcpServer>, String)> {
    let server = TcpServer::bind("127.0.0.1:0".parse()?, config.send_queue_depth).await?;
    let endpoint = server.local_addr().to_string();
    let publisher = Publisher::start(config, store, server)?;
    Ok((publisher, endpoint))
}

fn subscriber_config() -> SubscriberConfig {
    SubscriberConfig::default().receive_timeout_ms(200).reconnect_pause_ms(20)
}

/// Keep writing frames until cancelled, then hand the writer back so the
/// image outlives the producer.
fn produce(
    writer: ImageWriter,
    shape: FrameShape,
) -> (CancellationToken, tokio::task::JoinHandle<ImageWriter>) {
    let stop = CancellationToken::new();
    let task = {
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut seed = 0u16;
            while !stop.is_cancelled() {
                seed = seed.wrapping_add(1);
                if writer.write(&frame(shape, seed)).is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            writer
        })
    };
    (stop, task)
}

/// Wait until `store` holds `name` with at least `counter` frames.
async fn wait_for_frames(store: &ImageStore, name: &str, counter: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    loop {
        if let Ok(reader) = store.open(name) {
            if reader.status().frame_counter >= counter {
                return Ok(());
            }
        }
        ensure!(tokio::time::Instant::now() < deadline, "no frames of {} arrived", name);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `name` exists in `store`, then for `count` further frame
/// notifications. Coalesced notifications only make the wait longer, so at
/// least `count + 1` frames have arrived when this returns.
async fn wait_for_updates(store: &ImageStore, name: &str, count: usize) -> Result<()> {
    wait_for_frames(store, name, 1).await?;
    let mut updates = store.open(name)?.subscribe();
    let _ = updates.borrow_and_update();
    for seen in 0..count {
        tokio::time::timeout(PATIENCE, updates.changed())
            .await
            .with_context(|| format!("only {} of {} updates of {} arrived", seen, count, name))??;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compressed_frames_reach_the_mirror() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let cameras = ImageStore::new();
    let shape = camera_shape();
    let writer = cameras.create("cam0", shape);
    let source = writer.reader();
    let (stop, producer) = produce(writer, shape);

    let config = PublisherConfig::default().stream("cam0").fps_target(100.0).idle_interval_us(500);
    let (publisher, endpoint) = publish(config, cameras.clone()).await?;

    let mirror = ImageStore::new();
    let subscriber = Subscriber::start(
        subscriber_config().subscribe("cam0/cam0_mirror"),
        TcpClient::new(endpoint),
        mirror.clone(),
    )?;

    let mut states = subscriber.state_updates("cam0_mirror").context("no engine for cam0_mirror")?;
    let connected = tokio::time::timeout(PATIENCE, async {
        while let Some(state) = states.next().await {
            if state == ConnectionState::Connected {
                return true;
            }
        }
        false
    })
    .await?;
    ensure!(connected, "subscriber never connected");

    wait_for_updates(&mirror, "cam0_mirror", 5).await?;
    stop.cancel();
    let _writer = producer.await?;

    // The producer stopped, so the last frame stays put on both sides.
    let mirrored = mirror.open("cam0_mirror")?;
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while mirrored.status().frame_counter != source.status().frame_counter {
        ensure!(tokio::time::Instant::now() < deadline, "mirror never caught up");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(mirrored.status().shape, shape);
    assert_eq!(mirrored.latest(), source.latest());
    assert_eq!(mirrored.status().timestamp, source.status().timestamp);

    let received = subscriber.shutdown().await?;
    let published = publisher.shutdown().await?;

    let stats = received.streams["cam0_mirror"];
    assert!(stats.frames_received >= 5);
    assert_eq!(stats.sinks_created, 1);
    assert!(published.streams["cam0"].encodes >= stats.frames_received);
    assert!(published.router.requests >= stats.frames_received);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn publisher_shutdown_disconnects_subscribers() -> Result<()> {
    let cameras = ImageStore::new();
    let shape = FrameShape::new(32, 32, ElementType::UInt8);
    let writer = cameras.create("cam0", shape);
    writer.write(&vec![1u8; shape.slice_len()])?;

    let (publisher, endpoint) = publish(PublisherConfig::default().stream("cam0"), cameras).await?;
    let mirror = ImageStore::new();
    let subscriber =
        Subscriber::start(subscriber_config().subscribe("cam0"), TcpClient::new(endpoint), mirror.clone())?;

    wait_for_frames(&mirror, "cam0", 1).await?;
    publisher.shutdown().await?;

    let deadline = tokio::time::Instant::now() + PATIENCE;
    while subscriber.state("cam0") != Some(ConnectionState::Disconnected) {
        ensure!(tokio::time::Instant::now() < deadline, "subscriber never noticed the shutdown");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    ensure!(subscriber.is_running(), "a vanished publisher must not stop the subscriber");

    let report = subscriber.shutdown().await?;
    assert!(report.streams["cam0"].disconnects >= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn export_all_serves_new_images() -> Result<()> {
    let cameras = ImageStore::new();
    let config = PublisherConfig::default().export_all(true).catalog_poll_interval_ms(10);
    let (publisher, endpoint) = publish(config, cameras.clone()).await?;
    assert!(publisher.streams().is_empty());

    let shape = FrameShape::new(16, 16, ElementType::Int16);
    let writer = cameras.create("late", shape);
    let (stop, producer) = produce(writer, shape);

    let deadline = tokio::time::Instant::now() + PATIENCE;
    while publisher.streams() != vec!["late".to_string()] {
        ensure!(tokio::time::Instant::now() < deadline, "catalog watcher never picked up the image");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mirror = ImageStore::new();
    let subscriber =
        Subscriber::start(subscriber_config().subscribe("late"), TcpClient::new(endpoint), mirror.clone())?;
    wait_for_frames(&mirror, "late", 1).await?;

    stop.cancel();
    let _writer = producer.await?;
    subscriber.shutdown().await?;
    let report = publisher.shutdown().await?;
    assert!(report.streams["late"].frames_sent >= 1);
    Ok(())
}

#[tokio::test]
async fn invalid_configuration_is_rejected() -> Result<()> {
    let server = TcpServer::bind("127.0.0.1:0".parse()?, 4).await?;
    let config = PublisherConfig::default().stream("cam0").fps_target(-1.0);
    let result = Publisher::start(config, ImageStore::new(), server);
    ensure!(result.is_err(), "negative fps target was accepted");

    let config = SubscriberConfig::default().subscribe("/nothing");
    ensure!(Subscriber::connect_tcp(config, ImageStore::new()).is_err(), "empty remote accepted");
    Ok(())
}
