//! `OFFLOAD_*` environment lookups.
//!
//! The engine's configuration layer reads its overrides through these
//! helpers. Two flavours: lenient lookups that fall back to a default on
//! an unset *or* malformed value, and `env_parse`, which reports the
//! malformed case.
//!
//! ```ignore
//! use offload_core::env::{env_get, env_get_bool, env_get_opt};
//!
//! let slots: usize = env_get("OFFLOAD_N_ENTRIES", 128);
//! let release = env_get_bool("OFFLOAD_RELEASE_AFTER_WRITE", true);
//! let dir: Option<std::path::PathBuf> = env_get_opt("OFFLOAD_DIR");
//! ```

use std::str::FromStr;

/// Strict lookup: `Ok(None)` when unset, the parser's error when malformed.
pub fn env_parse<T>(key: &str) -> Result<Option<T>, T::Err>
where
    T: FromStr,
{
    std::env::var(key).ok().map(|raw| raw.trim().parse()).transpose()
}

/// Parsed value, or `None` when unset or malformed.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    env_parse(key).ok().flatten()
}

/// Parsed value, or `default` when unset or malformed.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// On/off switch. `1`, `true`, `yes`, `on` (any case) switch it on; any
/// other set value switches it off; unset keeps `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |raw| is_truthy(&raw))
}

fn is_truthy(raw: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|word| raw.trim().eq_ignore_ascii_case(word))
}
