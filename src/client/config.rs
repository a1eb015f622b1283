//! Relay client configuration and its builder.
//!
//! [`RelayClientBuilder`] validates user supplied values before producing a
//! [`RelayClientConfig`], which [`FemtoRelayClient`](super::FemtoRelayClient)
//! consumes at start-up.

use std::{path::PathBuf, time::Duration};

use crossbeam_channel::Sender;

use crate::backoff::BackoffPolicy;
use crate::builder::{BuildError, ensure_positive, option_setter, require_address};
use crate::rate_limited_warner::DEFAULT_WARN_INTERVAL;
use crate::transport::TlsOptions;
use crate::wire::{CodecKind, DEFAULT_MAX_FRAME_SIZE, Mode};

use super::{FemtoRelayClient, RelayError};

/// Default number of events a streaming client holds before refusing more.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
/// Default connection timeout, also bounding the TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default write timeout applied to socket writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default time allowed for the server to acknowledge one event.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration of one relay client.
#[derive(Clone, Debug)]
pub struct RelayClientConfig {
    /// Collector address as `host:port`.
    pub address: String,
    pub tls: Option<TlsOptions>,
    /// Persistent stream, or one connection per event.
    pub mode: Mode,
    pub codec: CodecKind,
    pub capacity: usize,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub ack_timeout: Duration,
    pub max_frame_size: usize,
    pub backoff: BackoffPolicy,
    /// Seed for backoff jitter and request ids; `None` seeds from the OS.
    pub rng_seed: Option<u64>,
    pub warn_interval: Duration,
    /// Receives terminal errors. When unset, a supervisor thread logs them.
    pub error_sink: Option<Sender<RelayError>>,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:9020".into(),
            tls: None,
            mode: Mode::Stream,
            codec: CodecKind::MessagePack,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backoff: BackoffPolicy::default(),
            rng_seed: None,
            warn_interval: DEFAULT_WARN_INTERVAL,
            error_sink: None,
        }
    }
}

impl RelayClientConfig {
    /// Copy of this configuration targeting another address.
    ///
    /// TLS options follow the new address unless an explicit domain other
    /// than the previous host was configured.
    pub fn with_address(&self, address: impl Into<String>) -> Self {
        let address = address.into();
        let mut config = self.clone();
        if let Some(tls) = &mut config.tls
            && tls.domain == host_of(&self.address)
        {
            tls.domain = host_of(&address).to_owned();
        }
        config.address = address;
        config
    }
}

fn host_of(address: &str) -> &str {
    match address.rsplit_once(':') {
        Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
        None => address,
    }
}

#[derive(Clone, Debug, Default)]
struct TlsConfig {
    domain: Option<String>,
    ca_path: Option<PathBuf>,
    insecure: bool,
}

/// Overrides for the backoff policy applied by the client.
#[derive(Clone, Debug, Default)]
pub struct BackoffOverrides {
    ceiling_ms: Option<u64>,
    max_jitter_ms: Option<u64>,
}

impl BackoffOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the ceiling in milliseconds.
    pub fn with_ceiling_ms(mut self, ceiling_ms: u64) -> Self {
        self.ceiling_ms = Some(ceiling_ms);
        self
    }

    /// Override the jitter bound in milliseconds. Zero disables jitter.
    pub fn with_max_jitter_ms(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = Some(max_jitter_ms);
        self
    }

    fn apply(&self, policy: &mut BackoffPolicy) -> Result<(), BuildError> {
        if let Some(ceiling) = self.ceiling_ms {
            ensure_positive!(ceiling, "backoff_ceiling_ms")?;
            policy.ceiling = Duration::from_millis(ceiling);
        }
        if let Some(jitter) = self.max_jitter_ms {
            policy.max_jitter = Duration::from_millis(jitter);
        }
        Ok(())
    }
}

/// Builder for [`FemtoRelayClient`] instances.
#[derive(Clone, Debug, Default)]
pub struct RelayClientBuilder {
    address: Option<String>,
    tls: Option<TlsConfig>,
    mode: Option<Mode>,
    codec: Option<CodecKind>,
    capacity: Option<usize>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    ack_timeout_ms: Option<u64>,
    max_frame_size: Option<usize>,
    rng_seed: Option<u64>,
    warn_interval_ms: Option<u64>,
    backoff: BackoffOverrides,
    error_sink: Option<Sender<RelayError>>,
}

impl RelayClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target collector as `host:port`.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Enable TLS. The domain defaults to the address host.
    pub fn with_tls(mut self, domain: Option<String>, insecure: bool) -> Self {
        let tls = self.tls.get_or_insert_with(TlsConfig::default);
        tls.domain = domain;
        tls.insecure = insecure;
        self
    }

    /// Trust an extra PEM root certificate. Implies TLS.
    pub fn with_tls_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls.get_or_insert_with(TlsConfig::default).ca_path = Some(path.into());
        self
    }

    option_setter!(
        #[doc = "Choose between a persistent stream and one connection per event."]
        with_mode,
        mode,
        Mode
    );
    option_setter!(with_codec, codec, CodecKind);
    option_setter!(
        #[doc = "Set how many events may wait while streaming."]
        with_capacity,
        capacity,
        usize
    );
    option_setter!(with_connect_timeout_ms, connect_timeout_ms, u64);
    option_setter!(with_write_timeout_ms, write_timeout_ms, u64);
    option_setter!(with_ack_timeout_ms, ack_timeout_ms, u64);
    option_setter!(with_max_frame_size, max_frame_size, usize);
    option_setter!(
        #[doc = "Seed jitter and request ids for reproducible runs."]
        with_rng_seed,
        rng_seed,
        u64
    );
    option_setter!(with_warn_interval_ms, warn_interval_ms, u64);
    option_setter!(
        #[doc = "Deliver terminal errors to `value` instead of the log."]
        with_error_sink,
        error_sink,
        Sender<RelayError>
    );

    /// Override backoff timings using the provided overrides.
    pub fn with_backoff(mut self, overrides: BackoffOverrides) -> Self {
        self.backoff = overrides;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        if let Some(capacity) = self.capacity {
            ensure_positive!(capacity, "capacity")?;
        }
        for (value, field) in [
            (self.connect_timeout_ms, "connect_timeout_ms"),
            (self.write_timeout_ms, "write_timeout_ms"),
            (self.ack_timeout_ms, "ack_timeout_ms"),
            (self.warn_interval_ms, "warn_interval_ms"),
        ] {
            if let Some(timeout) = value {
                ensure_positive!(timeout, field)?;
            }
        }
        if let Some(size) = self.max_frame_size {
            ensure_positive!(size, "max_frame_size")?;
            if u32::try_from(size).is_err() {
                return Err(BuildError::InvalidConfig(
                    "max_frame_size must fit in 32 bits".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validate the builder and produce the runtime configuration.
    pub fn build_config(&self) -> Result<RelayClientConfig, BuildError> {
        self.validate()?;
        let address = require_address(self.address.as_deref(), "client")?;
        let mut config = RelayClientConfig {
            tls: self.build_tls_options(&address),
            address,
            ..RelayClientConfig::default()
        };
        self.apply_optional_fields(&mut config);
        self.backoff.apply(&mut config.backoff)?;
        Ok(config)
    }

    fn apply_optional_fields(&self, config: &mut RelayClientConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = self.write_timeout_ms {
            config.write_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = self.ack_timeout_ms {
            config.ack_timeout = Duration::from_millis(timeout);
        }
        if let Some(size) = self.max_frame_size {
            config.max_frame_size = size;
        }
        if let Some(interval) = self.warn_interval_ms {
            config.warn_interval = Duration::from_millis(interval);
        }
        config.rng_seed = self.rng_seed;
        config.error_sink = self.error_sink.clone();
    }

    fn build_tls_options(&self, address: &str) -> Option<TlsOptions> {
        self.tls.as_ref().map(|tls_cfg| TlsOptions {
            domain: tls_cfg
                .domain
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| host_of(address).to_owned()),
            ca_path: tls_cfg.ca_path.clone(),
            insecure_skip_verify: tls_cfg.insecure,
        })
    }

    /// Validate the configuration and start the client.
    pub fn build(&self) -> Result<FemtoRelayClient, BuildError> {
        Ok(FemtoRelayClient::with_config(self.build_config()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn builder_requires_address() {
        let err = RelayClientBuilder::new()
            .build_config()
            .expect_err("address must be required");
        assert!(matches!(err, BuildError::InvalidConfig(msg) if msg.contains("address")));
    }

    #[rstest]
    #[case(RelayClientBuilder::new().with_capacity(0), "capacity")]
    #[case(RelayClientBuilder::new().with_ack_timeout_ms(0), "ack_timeout_ms")]
    #[case(RelayClientBuilder::new().with_max_frame_size(0), "max_frame_size")]
    #[case(
        RelayClientBuilder::new().with_backoff(BackoffOverrides::new().with_ceiling_ms(0)),
        "backoff_ceiling_ms"
    )]
    fn builder_rejects_zero_values(#[case] builder: RelayClientBuilder, #[case] field: &str) {
        let err = builder
            .with_address("127.0.0.1:9020")
            .build_config()
            .expect_err("zero value must fail");
        assert!(matches!(err, BuildError::InvalidConfig(msg) if msg.contains(field)));
    }

    #[rstest]
    fn zero_jitter_is_allowed() {
        let config = RelayClientBuilder::new()
            .with_address("127.0.0.1:9020")
            .with_backoff(
                BackoffOverrides::new()
                    .with_ceiling_ms(500)
                    .with_max_jitter_ms(0),
            )
            .build_config()
            .expect("valid config");
        assert_eq!(config.backoff.ceiling, Duration::from_millis(500));
        assert!(config.backoff.max_jitter.is_zero());
    }

    #[rstest]
    fn tls_domain_defaults_to_host() {
        let config = RelayClientBuilder::new()
            .with_address("logs.example.com:9020")
            .with_tls(None, false)
            .build_config()
            .expect("valid config");
        let tls = config.tls.expect("tls enabled");
        assert_eq!(tls.domain, "logs.example.com");
        assert!(!tls.insecure_skip_verify);
    }

    #[rstest]
    fn with_address_retargets_default_tls_domain() {
        let config = RelayClientBuilder::new()
            .with_address("a.example.com:9020")
            .with_tls_ca("/etc/ca.pem")
            .build_config()
            .expect("valid config")
            .with_address("b.example.com:9021");
        let tls = config.tls.expect("tls enabled");
        assert_eq!(tls.domain, "b.example.com");
        assert_eq!(tls.ca_path, Some(PathBuf::from("/etc/ca.pem")));
    }
}
