//! Severity levels carried by relayed events.
//!
//! The numeric values are part of the wire format: `panic` deliberately sits
//! at 9 so decoders can tell a terminal-intent marker apart from the ordinary
//! severities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FemtoLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Panic,
}

/// Errors raised when a level cannot be recognised.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LevelError {
    #[error("unknown level value {0}")]
    UnknownValue(i32),
    #[error("unknown level name {0:?}")]
    UnknownName(String),
}

impl FemtoLevel {
    /// All levels in ascending severity.
    pub const ALL: [FemtoLevel; 7] = [
        FemtoLevel::Trace,
        FemtoLevel::Debug,
        FemtoLevel::Info,
        FemtoLevel::Warn,
        FemtoLevel::Error,
        FemtoLevel::Fatal,
        FemtoLevel::Panic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FemtoLevel::Trace => "trace",
            FemtoLevel::Debug => "debug",
            FemtoLevel::Info => "info",
            FemtoLevel::Warn => "warn",
            FemtoLevel::Error => "error",
            FemtoLevel::Fatal => "fatal",
            FemtoLevel::Panic => "panic",
        }
    }

    /// Numeric representation used on the wire.
    pub fn as_i32(self) -> i32 {
        match self {
            FemtoLevel::Trace => 0,
            FemtoLevel::Debug => 1,
            FemtoLevel::Info => 2,
            FemtoLevel::Warn => 3,
            FemtoLevel::Error => 4,
            FemtoLevel::Fatal => 5,
            FemtoLevel::Panic => 9,
        }
    }

    /// Parse `s`, falling back to [`FemtoLevel::Info`] for unknown names.
    pub fn parse_or_info(s: &str) -> Self {
        s.parse().unwrap_or(Self::Info)
    }
}

impl fmt::Display for FemtoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FemtoLevel {
    type Err = LevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "fatal" => Ok(Self::Fatal),
            "panic" => Ok(Self::Panic),
            _ => Err(LevelError::UnknownName(s.to_owned())),
        }
    }
}

impl TryFrom<i32> for FemtoLevel {
    type Error = LevelError;

    fn try_from(value: i32) -> Result<Self, LevelError> {
        match value {
            0 => Ok(Self::Trace),
            1 => Ok(Self::Debug),
            2 => Ok(Self::Info),
            3 => Ok(Self::Warn),
            4 => Ok(Self::Error),
            5 => Ok(Self::Fatal),
            9 => Ok(Self::Panic),
            other => Err(LevelError::UnknownValue(other)),
        }
    }
}

impl From<log::Level> for FemtoLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => FemtoLevel::Trace,
            log::Level::Debug => FemtoLevel::Debug,
            log::Level::Info => FemtoLevel::Info,
            log::Level::Warn => FemtoLevel::Warn,
            log::Level::Error => FemtoLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("INFO", FemtoLevel::Info)]
    #[case("warning", FemtoLevel::Warn)]
    #[case(" Panic ", FemtoLevel::Panic)]
    #[case("fatal", FemtoLevel::Fatal)]
    fn parses_names_case_insensitively(#[case] name: &str, #[case] expected: FemtoLevel) {
        assert_eq!(name.parse::<FemtoLevel>(), Ok(expected));
    }

    #[rstest]
    fn numeric_values_round_trip() {
        for level in FemtoLevel::ALL {
            assert_eq!(FemtoLevel::try_from(level.as_i32()), Ok(level));
        }
    }

    #[rstest]
    #[case(6)]
    #[case(7)]
    #[case(-1)]
    fn rejects_unassigned_values(#[case] value: i32) {
        assert_eq!(
            FemtoLevel::try_from(value),
            Err(LevelError::UnknownValue(value))
        );
    }

    #[rstest]
    fn unknown_names_fall_back_to_info() {
        assert_eq!(FemtoLevel::parse_or_info("verbose"), FemtoLevel::Info);
    }
}
