//! Payload codecs and the ordered decode chain.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Payload encodings understood by the relay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CodecKind {
    /// MessagePack with named struct fields.
    #[default]
    MessagePack,
    Json,
}

/// Failure of a single codec.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{codec} codec: {message}")]
pub struct CodecError {
    pub codec: CodecKind,
    pub message: String,
}

/// Failure of every codec in a [`CodecChain`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct DecodeError {
    pub attempts: Vec<CodecError>,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode message")?;
        for (idx, attempt) in self.attempts.iter().enumerate() {
            let sep = if idx == 0 { ": " } else { "; " };
            write!(f, "{sep}{attempt}")?;
        }
        Ok(())
    }
}

impl CodecKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::MessagePack => "msgpack",
            CodecKind::Json => "json",
        }
    }

    fn error(self, err: impl fmt::Display) -> CodecError {
        CodecError {
            codec: self,
            message: err.to_string(),
        }
    }

    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            CodecKind::MessagePack => rmp_serde::to_vec_named(value).map_err(|e| self.error(e)),
            CodecKind::Json => serde_json::to_vec(value).map_err(|e| self.error(e)),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            CodecKind::MessagePack => rmp_serde::from_slice(bytes).map_err(|e| self.error(e)),
            CodecKind::Json => serde_json::from_slice(bytes).map_err(|e| self.error(e)),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "msgpack" | "messagepack" => Ok(CodecKind::MessagePack),
            "json" => Ok(CodecKind::Json),
            other => Err(format!("unknown codec {other:?}")),
        }
    }
}

/// Ordered list of codecs tried in sequence when decoding inbound bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecChain {
    codecs: Vec<CodecKind>,
}

impl Default for CodecChain {
    fn default() -> Self {
        Self::new(vec![CodecKind::MessagePack, CodecKind::Json])
    }
}

impl CodecChain {
    pub fn new(codecs: Vec<CodecKind>) -> Self {
        Self { codecs }
    }

    /// Codec used for replies when the request could not be decoded.
    pub fn primary(&self) -> CodecKind {
        self.codecs.first().copied().unwrap_or_default()
    }

    pub fn codecs(&self) -> &[CodecKind] {
        &self.codecs
    }

    /// Decode `bytes` with the first codec that accepts them.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<(T, CodecKind), DecodeError> {
        let mut attempts = Vec::with_capacity(self.codecs.len());
        for &codec in &self.codecs {
            match codec.decode(bytes) {
                Ok(value) => return Ok((value, codec)),
                Err(err) => attempts.push(err),
            }
        }
        Err(DecodeError { attempts })
    }
}
