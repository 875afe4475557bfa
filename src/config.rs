//! Publisher and subscriber configuration.
//!
//! Both configurations deserialize from YAML with every field optional:
//!
//! ```yaml
//! # publisher.yaml
//! port: 5556
//! streams: [cam0, wfs]
//! fps_target: 20.0
//! compression:
//!   compress: none
//! ```
//!
//! ```yaml
//! # subscriber.yaml
//! address: aoc-server.local
//! subscriptions: ["cam0/cam0_remote"]
//! receive_timeout_ms: 2000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecParams;
use crate::{RelayError, Result};

/// Port both sides use unless configured otherwise.
pub const DEFAULT_PORT: u16 = 5556;

/// Publisher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublisherConfig {
    /// Address to listen on.
    pub bind_address: String,
    pub port: u16,
    /// Streams served from startup.
    pub streams: Vec<String>,
    /// Serve every image in the source catalog, including ones that appear
    /// later.
    pub export_all: bool,
    pub catalog_poll_interval_ms: u64,
    /// Target frames per second per stream.
    pub fps_target: f64,
    /// Integrator gain of the rate governor.
    pub fps_gain: f64,
    /// Sleep between source polls when no new frame is available.
    pub idle_interval_us: u64,
    /// Pause between attempts to open a missing source.
    pub open_retry_ms: u64,
    /// Messages buffered per subscriber before frames are dropped.
    pub send_queue_depth: usize,
    pub compression: CodecParams,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            streams: Vec::new(),
            export_all: false,
            catalog_poll_interval_ms: 1000,
            fps_target: 10.0,
            fps_gain: 0.1,
            idle_interval_us: 1000,
            open_retry_ms: 1000,
            send_queue_depth: 4,
            compression: CodecParams::default(),
        }
    }
}

impl PublisherConfig {
    /// Parse a YAML document and validate it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(RelayError::config("port must not be 0"));
        }
        if !self.fps_target.is_finite() || self.fps_target < 0.0 {
            return Err(RelayError::config(format!(
                "fps_target must be a non-negative number, got {}",
                self.fps_target
            )));
        }
        if !self.fps_gain.is_finite() || self.fps_gain < 0.0 {
            return Err(RelayError::config(format!(
                "fps_gain must be a non-negative number, got {}",
                self.fps_gain
            )));
        }
        if self.idle_interval_us == 0 {
            return Err(RelayError::config("idle_interval_us must be positive"));
        }
        if self.send_queue_depth == 0 {
            return Err(RelayError::config("send_queue_depth must be positive"));
        }
        if self.export_all && self.catalog_poll_interval_ms == 0 {
            return Err(RelayError::config("catalog_poll_interval_ms must be positive"));
        }
        if let Some(empty) = self.streams.iter().position(|s| s.is_empty()) {
            return Err(RelayError::config(format!("stream #{} has an empty name", empty)));
        }
        Ok(())
    }

    /// `bind_address:port`, ready for socket address parsing.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_micros(self.idle_interval_us)
    }

    pub fn open_retry(&self) -> Duration {
        Duration::from_millis(self.open_retry_ms)
    }

    pub fn catalog_poll_interval(&self) -> Duration {
        Duration::from_millis(self.catalog_poll_interval_ms)
    }

    /// Add a stream to serve.
    pub fn stream(mut self, name: impl Into<String>) -> Self {
        self.streams.push(name.into());
        self
    }

    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn export_all(mut self, enabled: bool) -> Self {
        self.export_all = enabled;
        self
    }

    pub fn catalog_poll_interval_ms(mut self, interval: u64) -> Self {
        self.catalog_poll_interval_ms = interval;
        self
    }

    pub fn fps_target(mut self, fps: f64) -> Self {
        self.fps_target = fps;
        self
    }

    pub fn fps_gain(mut self, gain: f64) -> Self {
        self.fps_gain = gain;
        self
    }

    pub fn idle_interval_us(mut self, micros: u64) -> Self {
        self.idle_interval_us = micros;
        self
    }

    pub fn open_retry_ms(mut self, millis: u64) -> Self {
        self.open_retry_ms = millis;
        self
    }

    pub fn send_queue_depth(mut self, depth: usize) -> Self {
        self.send_queue_depth = depth;
        self
    }

    pub fn compression(mut self, params: CodecParams) -> Self {
        self.compression = params;
        self
    }

    /// Send raw pixels.
    pub fn no_compression(self) -> Self {
        self.compression(CodecParams::none())
    }
}

/// Subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriberConfig {
    /// Publisher host name or address.
    pub address: String,
    pub port: u16,
    /// Subscriptions in `remote[/local]` form.
    pub subscriptions: Vec<String>,
    /// Re-send the request after this long without a frame.
    pub receive_timeout_ms: u64,
    /// Pause before reconnecting after a disconnect.
    pub reconnect_pause_ms: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            address: "localhost".to_string(),
            port: DEFAULT_PORT,
            subscriptions: Vec::new(),
            receive_timeout_ms: 5000,
            reconnect_pause_ms: 1000,
        }
    }
}

impl SubscriberConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(RelayError::config("address must not be empty"));
        }
        if self.port == 0 {
            return Err(RelayError::config("port must not be 0"));
        }
        if self.receive_timeout_ms == 0 {
            return Err(RelayError::config("receive_timeout_ms must be positive"));
        }
        for spec in &self.subscriptions {
            crate::subscriber::Subscription::parse(spec)?;
        }
        Ok(())
    }

    /// `address:port` of the publisher.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn reconnect_pause(&self) -> Duration {
        Duration::from_millis(self.reconnect_pause_ms)
    }

    /// Add a subscription in `remote[/local]` form.
    pub fn subscribe(mut self, spec: impl Into<String>) -> Self {
        self.subscriptions.push(spec.into());
        self
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn receive_timeout_ms(mut self, millis: u64) -> Self {
        self.receive_timeout_ms = millis;
        self
    }

    pub fn reconnect_pause_ms(mut self, millis: u64) -> Self {
        self.reconnect_pause_ms = millis;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CompressMethod;

    #[test]
    fn publisher_defaults() {
        let config = PublisherConfig::default();
        assert_eq!(config.port, 5556);
        assert_eq!(config.fps_target, 10.0);
        assert_eq!(config.fps_gain, 0.1);
        assert_eq!(config.idle_interval(), Duration::from_micros(1000));
        assert_eq!(config.open_retry(), Duration::from_secs(1));
        assert_eq!(config.listen_address(), "0.0.0.0:5556");
        config.validate().unwrap();
    }

    #[test]
    fn subscriber_defaults() {
        let config = SubscriberConfig::default();
        assert_eq!(config.endpoint(), "localhost:5556");
        assert_eq!(config.receive_timeout(), Duration::from_secs(5));
        assert_eq!(config.reconnect_pause(), Duration::from_secs(1));
        config.validate().unwrap();
    }

    #[test]
    fn publisher_yaml_overrides_defaults() {
        let config = PublisherConfig::from_yaml_str(
            "port: 6000\nstreams: [cam0, wfs]\nfps_target: 20.0\ncompression:\n  compress: none\n",
        )
        .unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.streams, vec!["cam0".to_string(), "wfs".to_string()]);
        assert_eq!(config.fps_target, 20.0);
        assert_eq!(config.fps_gain, 0.1);
        assert_eq!(config.compression.compress, CompressMethod::None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = PublisherConfig::from_yaml_str("prot: 6000").unwrap_err();
        assert!(matches!(err, RelayError::Config { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(PublisherConfig::default().fps_target(-1.0).validate().is_err());
        assert!(PublisherConfig::default().fps_gain(f64::NAN).validate().is_err());
        assert!(PublisherConfig::default().send_queue_depth(0).validate().is_err());
        assert!(PublisherConfig::default().stream("").validate().is_err());
        assert!(SubscriberConfig::default().receive_timeout_ms(0).validate().is_err());
        assert!(SubscriberConfig::default().subscribe("/local").validate().is_err());
    }

    #[test]
    fn subscriber_yaml_round_trip() {
        let config = SubscriberConfig::default()
            .address("10.0.0.2")
            .subscribe("cam0/cam0_remote")
            .reconnect_pause_ms(250);
        let yaml = serde_yaml_ng::to_string(&config).unwrap();
        assert_eq!(SubscriberConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = SubscriberConfig::from_yaml_file("/nonexistent/framerelay.yaml").unwrap_err();
        assert!(matches!(err, RelayError::Io(_)));
    }
}
