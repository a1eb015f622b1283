//! Relay server configuration and its builder.

use std::{path::PathBuf, sync::Arc, time::Duration};

use crossbeam_channel::Sender;

use crate::builder::{BuildError, ensure_positive, option_setter, require_address};
use crate::sink::EventSink;
use crate::transport::TlsIdentity;
use crate::wire::{CodecChain, CodecKind, DEFAULT_MAX_FRAME_SIZE};

use super::{FemtoRelayServer, ServerError, ServerHandle};

/// Default interval at which blocked threads check for shutdown.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Default bound on the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default write timeout for acknowledgements.
pub const DEFAULT_SERVER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime configuration of a relay server.
#[derive(Clone, Debug)]
pub struct RelayServerConfig {
    /// Listen address as `host:port`; port 0 picks a free port.
    pub address: String,
    pub tls: Option<TlsIdentity>,
    /// End a stream that stays silent this long.
    pub idle_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_size: usize,
    /// Decoders tried in order for every inbound message.
    pub codecs: CodecChain,
    /// Log every exchange at trace level.
    pub log_exchanges: bool,
    /// Include handling time, logging at debug level instead.
    pub with_timer: bool,
    /// Receives per-message errors. When unset, a supervisor thread logs them.
    pub error_sink: Option<Sender<ServerError>>,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9020".into(),
            tls: None,
            idle_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_timeout: DEFAULT_SERVER_WRITE_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            codecs: CodecChain::default(),
            log_exchanges: false,
            with_timer: false,
            error_sink: None,
        }
    }
}

/// Builder for relay servers.
#[derive(Clone, Debug, Default)]
pub struct RelayServerBuilder {
    address: Option<String>,
    tls: Option<TlsIdentity>,
    idle_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    max_frame_size: Option<usize>,
    codecs: Option<Vec<CodecKind>>,
    log_exchanges: bool,
    with_timer: bool,
    error_sink: Option<Sender<ServerError>>,
}

impl RelayServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Serve TLS using a PEM certificate chain and PKCS#8 PEM private key.
    pub fn with_tls(mut self, cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        self.tls = Some(TlsIdentity::new(cert_path, key_path));
        self
    }

    option_setter!(with_idle_timeout_ms, idle_timeout_ms, u64);
    option_setter!(with_poll_interval_ms, poll_interval_ms, u64);
    option_setter!(with_handshake_timeout_ms, handshake_timeout_ms, u64);
    option_setter!(with_write_timeout_ms, write_timeout_ms, u64);
    option_setter!(with_max_frame_size, max_frame_size, usize);
    option_setter!(
        #[doc = "Replace the decoder order (MessagePack then JSON by default)."]
        with_codecs,
        codecs,
        Vec<CodecKind>
    );
    option_setter!(with_error_sink, error_sink, Sender<ServerError>);

    /// Log each exchange, optionally with its handling time.
    pub fn with_exchange_logging(mut self, with_timer: bool) -> Self {
        self.log_exchanges = true;
        self.with_timer = with_timer;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        for (value, field) in [
            (self.idle_timeout_ms, "idle_timeout_ms"),
            (self.poll_interval_ms, "poll_interval_ms"),
            (self.handshake_timeout_ms, "handshake_timeout_ms"),
            (self.write_timeout_ms, "write_timeout_ms"),
        ] {
            if let Some(timeout) = value {
                ensure_positive!(timeout, field)?;
            }
        }
        if let Some(size) = self.max_frame_size {
            ensure_positive!(size, "max_frame_size")?;
        }
        if self.codecs.as_ref().is_some_and(Vec::is_empty) {
            return Err(BuildError::InvalidConfig(
                "codecs must name at least one codec".into(),
            ));
        }
        Ok(())
    }

    pub fn build_config(&self) -> Result<RelayServerConfig, BuildError> {
        self.validate()?;
        let mut config = RelayServerConfig {
            address: require_address(self.address.as_deref(), "server")?,
            tls: self.tls.clone(),
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
            log_exchanges: self.log_exchanges,
            with_timer: self.with_timer,
            error_sink: self.error_sink.clone(),
            ..RelayServerConfig::default()
        };
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(interval);
        }
        if let Some(timeout) = self.handshake_timeout_ms {
            config.handshake_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = self.write_timeout_ms {
            config.write_timeout = Duration::from_millis(timeout);
        }
        if let Some(size) = self.max_frame_size {
            config.max_frame_size = size;
        }
        if let Some(codecs) = &self.codecs {
            config.codecs = CodecChain::new(codecs.clone());
        }
        Ok(config)
    }

    /// Validate, bind and start serving into `sink`.
    pub fn start(&self, sink: Arc<dyn EventSink>) -> Result<ServerHandle, ServerError> {
        FemtoRelayServer::new(self.build_config()?, sink).start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn builder_requires_address() {
        let err = RelayServerBuilder::new()
            .build_config()
            .expect_err("address must be required");
        assert!(matches!(err, BuildError::InvalidConfig(msg) if msg.contains("address")));
    }

    #[rstest]
    fn builder_rejects_empty_codec_list() {
        let err = RelayServerBuilder::new()
            .with_address("127.0.0.1:0")
            .with_codecs(Vec::new())
            .build_config()
            .expect_err("codecs required");
        assert!(matches!(err, BuildError::InvalidConfig(msg) if msg.contains("codecs")));
    }

    #[rstest]
    fn builder_applies_overrides() {
        let config = RelayServerBuilder::new()
            .with_address("127.0.0.1:0")
            .with_idle_timeout_ms(250)
            .with_codecs(vec![CodecKind::Json])
            .with_exchange_logging(true)
            .build_config()
            .expect("valid config");
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.codecs.codecs(), &[CodecKind::Json]);
        assert!(config.log_exchanges && config.with_timer);
    }
}
