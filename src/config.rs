//! INI configuration for relay clients and servers.
//!
//! A file may hold a `[server]` section, a `[client]` section, or both. Each
//! section fills the matching builder, so the usual builder validation runs
//! when the client or server is finally built.
//!
//! ```ini
//! [server]
//! address = 0.0.0.0:9020
//! idle_timeout_ms = 30000
//! codecs = msgpack, json
//!
//! [client]
//! address = collector.internal:9020
//! mode = stream
//! backoff_ceiling_ms = 30000
//! ```

use std::{fs, path::Path, str::FromStr};

use ini::{Ini, Properties};
use thiserror::Error;

use crate::client::{BackoffOverrides, RelayClientBuilder};
use crate::server::RelayServerBuilder;
use crate::wire::{CodecKind, Mode};

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid INI: {0}")]
    Parse(String),
    #[error("unknown key {key:?} in [{section}]")]
    UnknownKey { section: String, key: String },
    #[error("invalid value {value:?} for {key} in [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
    #[error("configuration has neither a [server] nor a [client] section")]
    Empty,
}

/// Builders loaded from a configuration file.
#[derive(Clone, Debug, Default)]
pub struct RelayConfig {
    pub server: Option<RelayServerBuilder>,
    pub client: Option<RelayClientBuilder>,
}

impl RelayConfig {
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        let mut config = Self::default();
        for (section, props) in ini.iter() {
            match section {
                Some("server") => config.server = Some(server_from(props)?),
                Some("client") => config.client = Some(client_from(props)?),
                Some(other) => log::debug!("ignoring configuration section [{other}]"),
                None if props.is_empty() => {}
                None => {
                    let key = props.iter().next().map(|(k, _)| k).unwrap_or_default();
                    return Err(ConfigError::UnknownKey {
                        section: "general".into(),
                        key: key.to_owned(),
                    });
                }
            }
        }
        if config.server.is_none() && config.client.is_none() {
            return Err(ConfigError::Empty);
        }
        Ok(config)
    }

    pub fn from_ini_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ini_str(&text)
    }
}

/// One `key = value` entry with enough context for error messages.
struct Entry<'a> {
    section: &'static str,
    key: &'a str,
    value: &'a str,
}

impl Entry<'_> {
    fn invalid(&self, reason: impl ToString) -> ConfigError {
        ConfigError::InvalidValue {
            section: self.section.into(),
            key: self.key.into(),
            value: self.value.into(),
            reason: reason.to_string(),
        }
    }

    fn parse<T>(&self) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: ToString,
    {
        self.value.trim().parse().map_err(|err: T::Err| self.invalid(err))
    }

    fn flag(&self) -> Result<bool, ConfigError> {
        match self.value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(self.invalid("expected a boolean")),
        }
    }

    fn codec(&self) -> Result<CodecKind, ConfigError> {
        self.parse()
    }

    fn mode(&self) -> Result<Mode, ConfigError> {
        match self.value.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(Mode::Stream),
            "unary" => Ok(Mode::Unary),
            _ => Err(self.invalid("expected stream or unary")),
        }
    }

    fn unknown(&self) -> ConfigError {
        ConfigError::UnknownKey {
            section: self.section.into(),
            key: self.key.into(),
        }
    }
}

fn entries<'a>(section: &'static str, props: &'a Properties) -> impl Iterator<Item = Entry<'a>> {
    props.iter().map(move |(key, value)| Entry {
        section,
        key,
        value,
    })
}

fn server_from(props: &Properties) -> Result<RelayServerBuilder, ConfigError> {
    let mut builder = RelayServerBuilder::new();
    let mut cert = None;
    let mut key = None;
    let mut log_exchanges = false;
    let mut with_timer = false;
    for entry in entries("server", props) {
        builder = match entry.key {
            "address" => builder.with_address(entry.value.trim()),
            "tls_cert" => {
                cert = Some(entry.value.trim().to_owned());
                builder
            }
            "tls_key" => {
                key = Some(entry.value.trim().to_owned());
                builder
            }
            "idle_timeout_ms" => builder.with_idle_timeout_ms(entry.parse()?),
            "poll_interval_ms" => builder.with_poll_interval_ms(entry.parse()?),
            "handshake_timeout_ms" => builder.with_handshake_timeout_ms(entry.parse()?),
            "write_timeout_ms" => builder.with_write_timeout_ms(entry.parse()?),
            "max_frame_size" => builder.with_max_frame_size(entry.parse()?),
            "codecs" => {
                let codecs = entry
                    .value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| name.parse::<CodecKind>().map_err(|err| entry.invalid(err)))
                    .collect::<Result<Vec<_>, _>>()?;
                builder.with_codecs(codecs)
            }
            "log_exchanges" => {
                log_exchanges = entry.flag()?;
                builder
            }
            "with_timer" => {
                with_timer = entry.flag()?;
                builder
            }
            _ => return Err(entry.unknown()),
        };
    }
    match (cert, key) {
        (Some(cert), Some(key)) => builder = builder.with_tls(cert, key),
        (None, None) => {}
        _ => {
            return Err(ConfigError::InvalidValue {
                section: "server".into(),
                key: "tls_cert".into(),
                value: String::new(),
                reason: "tls_cert and tls_key must be set together".into(),
            });
        }
    }
    if log_exchanges || with_timer {
        builder = builder.with_exchange_logging(with_timer);
    }
    Ok(builder)
}

fn client_from(props: &Properties) -> Result<RelayClientBuilder, ConfigError> {
    let mut builder = RelayClientBuilder::new();
    let mut backoff = BackoffOverrides::new();
    let mut tls = false;
    let mut domain = None;
    let mut insecure = false;
    for entry in entries("client", props) {
        builder = match entry.key {
            "address" => builder.with_address(entry.value.trim()),
            "mode" => builder.with_mode(entry.mode()?),
            "codec" => builder.with_codec(entry.codec()?),
            "tls" => {
                tls = entry.flag()?;
                builder
            }
            "tls_domain" => {
                tls = true;
                domain = Some(entry.value.trim().to_owned());
                builder
            }
            "tls_ca" => builder.with_tls_ca(entry.value.trim()),
            "tls_insecure" => {
                insecure = entry.flag()?;
                builder
            }
            "capacity" => builder.with_capacity(entry.parse()?),
            "connect_timeout_ms" => builder.with_connect_timeout_ms(entry.parse()?),
            "write_timeout_ms" => builder.with_write_timeout_ms(entry.parse()?),
            "ack_timeout_ms" => builder.with_ack_timeout_ms(entry.parse()?),
            "max_frame_size" => builder.with_max_frame_size(entry.parse()?),
            "rng_seed" => builder.with_rng_seed(entry.parse()?),
            "warn_interval_ms" => builder.with_warn_interval_ms(entry.parse()?),
            "backoff_ceiling_ms" => {
                backoff = backoff.with_ceiling_ms(entry.parse()?);
                builder
            }
            "backoff_max_jitter_ms" => {
                backoff = backoff.with_max_jitter_ms(entry.parse()?);
                builder
            }
            _ => return Err(entry.unknown()),
        };
    }
    if tls || insecure {
        builder = builder.with_tls(domain, insecure);
    }
    Ok(builder.with_backoff(backoff))
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
