//! Engine configuration.
//!
//! [`EngineConfig`] is a plain value: it can be built in code with
//! [`EngineConfig::builder`] or deserialized by the embedding application from whatever
//! source it loads configuration from. Durations are expressed in milliseconds when
//! deserialized.

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::buffer::{Charset, DEFAULT_MAX_CHUNK, DEFAULT_MIN_CHUNK};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("worker_threads must be at least 1")]
    NoWorkers,

    #[error("max_connections must be at least 1")]
    NoConnections,

    #[error("min_chunk_size {min} is larger than max_chunk_size {max}")]
    ChunkSizes { min: usize, max: usize },

    #[error("{name} must be non-zero")]
    Zero { name: &'static str },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads of the request worker pool.
    pub worker_threads: usize,
    /// Accept-interest is withdrawn once this many connections are open.
    pub max_connections: usize,
    /// Time allowed between accept and the first request byte.
    #[serde(deserialize_with = "millis")]
    pub startup_timeout: Duration,
    /// Time allowed between two reads of an incomplete request.
    #[serde(deserialize_with = "millis")]
    pub read_timeout: Duration,
    /// Time allowed for pending output to make progress.
    #[serde(deserialize_with = "millis")]
    pub write_timeout: Duration,
    /// Idle time allowed between two requests on a persistent connection.
    #[serde(deserialize_with = "millis")]
    pub keep_alive_timeout: Duration,
    /// Upper bound of a single readiness poll.
    #[serde(deserialize_with = "millis")]
    pub poll_interval: Duration,
    /// How long a graceful quit waits for connections and workers.
    #[serde(deserialize_with = "millis")]
    pub quit_timeout: Duration,
    pub max_body_size: u64,
    pub max_header_bytes: usize,
    pub max_headers: usize,
    /// Accept `Content-Encoding: gzip` request bodies.
    pub accept_gzip_requests: bool,
    /// Accept `Transfer-Encoding: chunked` request bodies.
    pub accept_chunked_requests: bool,
    /// Negotiate response compression for every response.
    pub compress_responses: bool,
    /// Charset added to `text/*` content types lacking one.
    pub default_charset: Charset,
    /// `Cache-Control` set on responses that don't carry one.
    pub default_cache_control: Option<String>,
    /// Terminate the process on internal failures.
    pub exit_on_fatal: bool,
    /// Report socket errors to handlers instead of swallowing them.
    pub propagate_output_errors: bool,
    /// Consecutive zero-work loop iterations tolerated, `None` disables the check.
    pub livelock_threshold: Option<u32>,
    /// Output bytes staged before a handler write blocks on the network.
    pub output_buffer_limit: usize,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Listen backlog of the bound sockets.
    pub backlog: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(8),
            max_connections: 1024,
            startup_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            quit_timeout: Duration::from_secs(10),
            max_body_size: 8 * 1024 * 1024,
            max_header_bytes: 8 * 1024,
            max_headers: 64,
            accept_gzip_requests: true,
            accept_chunked_requests: true,
            compress_responses: false,
            default_charset: Charset::Utf8,
            default_cache_control: None,
            exit_on_fatal: false,
            propagate_output_errors: false,
            livelock_threshold: Some(10_000),
            output_buffer_limit: 64 * 1024,
            min_chunk_size: DEFAULT_MIN_CHUNK,
            max_chunk_size: DEFAULT_MAX_CHUNK,
            backlog: 1024,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_connections == 0 {
            return Err(ConfigError::NoConnections);
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(ConfigError::ChunkSizes { min: self.min_chunk_size, max: self.max_chunk_size });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero { name: "poll_interval" });
        }
        if self.output_buffer_limit == 0 {
            return Err(ConfigError::Zero { name: "output_buffer_limit" });
        }
        Ok(())
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

macro_rules! setter {
    ($name:ident: $ty:ty) => {
        pub fn $name(mut self, $name: $ty) -> Self {
            self.config.$name = $name;
            self
        }
    };
}

impl EngineConfigBuilder {
    setter!(worker_threads: usize);
    setter!(max_connections: usize);
    setter!(startup_timeout: Duration);
    setter!(read_timeout: Duration);
    setter!(write_timeout: Duration);
    setter!(keep_alive_timeout: Duration);
    setter!(poll_interval: Duration);
    setter!(quit_timeout: Duration);
    setter!(max_body_size: u64);
    setter!(max_header_bytes: usize);
    setter!(max_headers: usize);
    setter!(accept_gzip_requests: bool);
    setter!(accept_chunked_requests: bool);
    setter!(compress_responses: bool);
    setter!(default_charset: Charset);
    setter!(exit_on_fatal: bool);
    setter!(propagate_output_errors: bool);
    setter!(livelock_threshold: Option<u32>);
    setter!(output_buffer_limit: usize);
    setter!(min_chunk_size: usize);
    setter!(max_chunk_size: usize);
    setter!(backlog: i32);

    pub fn default_cache_control(mut self, value: impl Into<String>) -> Self {
        self.config.default_cache_control = Some(value.into());
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
