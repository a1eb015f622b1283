//! Shared pieces of the client and server builders.

use std::io;

use thiserror::Error;

/// Errors that may occur while building a relay client or server.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid user supplied configuration.
    #[error("invalid relay configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error whilst starting the relay.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Validate that a value is greater than zero, returning an error otherwise.
macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err($crate::builder::BuildError::InvalidConfig(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

pub(crate) use ensure_positive;

/// Generate a consuming setter storing `Some(value)` in an optional field.
macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

pub(crate) use option_setter;

/// Reject blank `host:port` strings.
pub(crate) fn require_address(address: Option<&str>, role: &str) -> Result<String, BuildError> {
    match address.map(str::trim) {
        Some(address) if !address.is_empty() => Ok(address.to_owned()),
        _ => Err(BuildError::InvalidConfig(format!(
            "relay {role} requires an address"
        ))),
    }
}
