//! Backend selection.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Which kernel-async facility carries the I/O.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// io_uring submission/completion queues.
    #[default]
    Uring,
    /// POSIX AIO control blocks.
    Aio,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Uring => "uring",
            BackendKind::Aio => "aio",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uring" => Ok(BackendKind::Uring),
            "aio" => Ok(BackendKind::Aio),
            other => Err(ConfigError::UnsupportedBackend(other.to_string())),
        }
    }
}
