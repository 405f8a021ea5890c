//! Offloader configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use offload_engine::config::OffloadConfig;
//!
//! let config = OffloadConfig::from_env()?
//!     .n_entries(32)
//!     .backend(BackendKind::Aio);
//! ```

pub mod defaults;

use offload_core::backend::BackendKind;
use offload_core::env::{env_get, env_get_bool, env_get_opt};
use offload_core::error::ConfigError;

use std::path::{Path, PathBuf};
use std::time::Duration;

/// What `async_read` does with a buffer whose storage was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadAllocation {
    /// Allocate `nbytes()` of storage before submitting.
    #[default]
    Allocate,
    /// Fail with `EmptyBuffer`.
    Reject,
}

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    /// Existing directory that receives the backing file.
    pub directory: PathBuf,
    /// Slot capacity N.
    pub n_entries: usize,
    pub backend: BackendKind,
    /// How long the dispatcher waits for completions before polling again.
    pub idle_wait: Duration,
    pub max_submit_retries: u32,
    pub release_after_write: bool,
    pub read_allocation: ReadAllocation,
}

impl OffloadConfig {
    /// Defaults only, no environment lookup.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            n_entries: defaults::N_ENTRIES,
            backend: BackendKind::default(),
            idle_wait: Duration::from_micros(defaults::IDLE_WAIT_US),
            max_submit_retries: defaults::MAX_SUBMIT_RETRIES,
            release_after_write: defaults::RELEASE_AFTER_WRITE,
            read_allocation: ReadAllocation::default(),
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `OFFLOAD_DIR` - Backing file directory (default: system temp dir)
    /// - `OFFLOAD_N_ENTRIES` - Slot capacity
    /// - `OFFLOAD_BACKEND` - `uring` or `aio`
    /// - `OFFLOAD_IDLE_WAIT_US` - Dispatcher idle wait in microseconds
    /// - `OFFLOAD_MAX_SUBMIT_RETRIES` - Retries on a saturated driver
    /// - `OFFLOAD_RELEASE_AFTER_WRITE` - Free storage after write (0/1)
    ///
    /// An unknown backend name is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let directory = env_get_opt::<PathBuf>("OFFLOAD_DIR").unwrap_or_else(std::env::temp_dir);
        let backend_name: String = env_get("OFFLOAD_BACKEND", defaults::BACKEND.to_string());
        let backend = backend_name.parse::<BackendKind>()?;

        Ok(Self {
            directory,
            n_entries: env_get("OFFLOAD_N_ENTRIES", defaults::N_ENTRIES),
            backend,
            idle_wait: Duration::from_micros(env_get("OFFLOAD_IDLE_WAIT_US", defaults::IDLE_WAIT_US)),
            max_submit_retries: env_get("OFFLOAD_MAX_SUBMIT_RETRIES", defaults::MAX_SUBMIT_RETRIES),
            release_after_write: env_get_bool("OFFLOAD_RELEASE_AFTER_WRITE", defaults::RELEASE_AFTER_WRITE),
            read_allocation: ReadAllocation::default(),
        })
    }

    // Builder methods

    pub fn directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = dir.into();
        self
    }

    pub fn n_entries(mut self, n: usize) -> Self {
        self.n_entries = n;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn idle_wait(mut self, d: Duration) -> Self {
        self.idle_wait = d;
        self
    }

    pub fn max_submit_retries(mut self, n: u32) -> Self {
        self.max_submit_retries = n;
        self
    }

    pub fn release_after_write(mut self, enable: bool) -> Self {
        self.release_after_write = enable;
        self
    }

    pub fn read_allocation(mut self, policy: ReadAllocation) -> Self {
        self.read_allocation = policy;
        self
    }

    /// Validate configuration and return errors if invalid.
    ///
    /// The directory must already exist; this layer never creates it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_entries == 0 {
            return Err(ConfigError::ZeroEntries);
        }
        if !is_dir(&self.directory) {
            return Err(ConfigError::NotADirectory(self.directory.clone()));
        }
        Ok(())
    }
}

fn is_dir(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
}
