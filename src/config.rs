//! Runtime-configurable batch geometry and mode.
//!
//! Configuration is read from environment variables on first access, and can
//! be modified at runtime through a global singleton.
//!
//! # Environment Variables
//!
//! | Variable | Type | Default | Description |
//! |----------|------|---------|-------------|
//! | `GDS_BATCH_COMPAT_MODE` | `CompatMode` | `Auto` | Compatibility mode |
//! | `GDS_BATCH_SIZE` | `usize` | `128` | Batch cardinality (slots per batch) |
//! | `GDS_BATCH_SLOT_SIZE` | `usize` | `4096` | Per-slot transfer size (bytes) |
//! | `GDS_BATCH_REAP_WINDOW` | `usize` | `16` | Completion event buffer capacity |

use std::sync::{OnceLock, RwLock};

use crate::compat_mode::CompatMode;
use crate::error::{Error, ErrorKind};
use crate::subsystem::MAX_BATCH_ENTRIES;

/// Default batch cardinality.
const DEFAULT_BATCH_SIZE: usize = 128;

/// Default per-slot transfer size: 4 KiB.
const DEFAULT_SLOT_SIZE: usize = 4096;

/// Default completion event buffer capacity.
const DEFAULT_REAP_WINDOW: usize = 16;

/// Runtime configuration for gds-batch.
///
/// Thread-safe access through the global singleton via [`Config::get`] and
/// [`Config::set`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Compatibility mode (GDS/POSIX/Auto).
    pub compat_mode: CompatMode,
    /// Number of slots submitted per batch.
    pub batch_size: usize,
    /// Transfer size of each slot (bytes).
    pub slot_size: usize,
    /// Capacity of the completion event buffer used by the reap loop.
    pub reap_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            compat_mode: CompatMode::Auto,
            batch_size: DEFAULT_BATCH_SIZE,
            slot_size: DEFAULT_SLOT_SIZE,
            reap_window: DEFAULT_REAP_WINDOW,
        }
    }
}

/// Global configuration singleton.
static GLOBAL_CONFIG: OnceLock<RwLock<Config>> = OnceLock::new();

impl Config {
    /// Create a configuration from environment variables, falling back to defaults.
    pub fn from_env() -> crate::error::Result<Self> {
        let mut config = Config::default();

        if let Some(val) = env_var("GDS_BATCH_COMPAT_MODE")? {
            config.compat_mode = CompatMode::parse(&val)?;
        }

        if let Some(val) = env_var("GDS_BATCH_SIZE")? {
            config.batch_size = parse_usize(&val, "GDS_BATCH_SIZE")?;
        }

        if let Some(val) = env_var("GDS_BATCH_SLOT_SIZE")? {
            config.slot_size = parse_usize(&val, "GDS_BATCH_SLOT_SIZE")?;
        }

        if let Some(val) = env_var("GDS_BATCH_REAP_WINDOW")? {
            config.reap_window = parse_usize(&val, "GDS_BATCH_REAP_WINDOW")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the batch geometry is usable.
    ///
    /// The batch size must fit the subsystem's tracking limit, and both the
    /// slot size and reap window must be non-zero. The reap window may be
    /// smaller than the batch; the reap loop is built for exactly that.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_ENTRIES {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!(
                    "batch_size must be in 1..={MAX_BATCH_ENTRIES}, got {}",
                    self.batch_size
                ),
            )
            .with_operation("Config::validate"));
        }
        if self.slot_size == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "slot_size must be non-zero")
                    .with_operation("Config::validate"),
            );
        }
        if self.reap_window == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "reap_window must be non-zero")
                    .with_operation("Config::validate"),
            );
        }
        Ok(())
    }

    /// Get a read-only snapshot of the global configuration.
    ///
    /// On first call, reads from environment variables. Subsequent calls return
    /// the (possibly modified) global configuration.
    pub fn get() -> Config {
        let lock = GLOBAL_CONFIG.get_or_init(|| {
            let config = Config::from_env().unwrap_or_default();
            RwLock::new(config)
        });
        lock.read().expect("config lock poisoned").clone()
    }

    /// Replace the global configuration.
    pub fn set(config: Config) {
        let lock = GLOBAL_CONFIG.get_or_init(|| RwLock::new(Config::default()));
        let mut guard = lock.write().expect("config lock poisoned");
        *guard = config;
    }

    /// Modify the global configuration in place via a closure.
    pub fn update(f: impl FnOnce(&mut Config)) {
        let lock = GLOBAL_CONFIG.get_or_init(|| RwLock::new(Config::default()));
        let mut guard = lock.write().expect("config lock poisoned");
        f(&mut guard);
    }
}

/// Read an environment variable, returning `None` if it is unset or empty.
fn env_var(name: &str) -> crate::error::Result<Option<String>> {
    match std::env::var(name) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::new(
            ErrorKind::ConfigInvalid,
            format!("environment variable {name} contains invalid Unicode"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", name)),
    }
}

fn parse_usize(val: &str, var_name: &str) -> crate::error::Result<usize> {
    val.trim().parse::<usize>().map_err(|e| {
        Error::new(
            ErrorKind::ConfigInvalid,
            format!("invalid value for {var_name}: {val:?}"),
        )
        .with_operation("Config::from_env")
        .with_context("env_var", var_name)
        .set_source(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Helper to temporarily set env vars for a test.
    // Note: env var tests are inherently not thread-safe, but Rust's test
    // runner runs them in separate threads. We use unique var names where possible.
    struct EnvVarGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvVarGuard {
        fn new(vars: &[(&str, &str)]) -> Self {
            let mut saved = Vec::new();
            for (key, value) in vars {
                saved.push((key.to_string(), env::var(key).ok()));
                // SAFETY: Tests are run with --test-threads=1 or we use unique
                // env var names. No other threads are reading these env vars.
                unsafe { env::set_var(key, value) };
            }
            EnvVarGuard { vars: saved }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            for (key, prev) in &self.vars {
                // SAFETY: See EnvVarGuard::new.
                match prev {
                    Some(val) => unsafe { env::set_var(key, val) },
                    None => unsafe { env::remove_var(key) },
                }
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.compat_mode, CompatMode::Auto);
        assert_eq!(config.batch_size, 128);
        assert_eq!(config.slot_size, 4096);
        assert_eq!(config.reap_window, 16);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_usize_valid() {
        assert_eq!(parse_usize("42", "TEST").unwrap(), 42);
        assert_eq!(parse_usize("  100  ", "TEST").unwrap(), 100);
        assert_eq!(parse_usize("4096", "TEST").unwrap(), 4096);
    }

    #[test]
    fn test_parse_usize_invalid() {
        let err = parse_usize("abc", "TEST_VAR").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        assert!(err.message().contains("TEST_VAR"));

        let err = parse_usize("-1", "TEST_VAR").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_validate_batch_size_bounds() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );

        let config = Config {
            batch_size: MAX_BATCH_ENTRIES + 1,
            ..Config::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );

        let config = Config {
            batch_size: MAX_BATCH_ENTRIES,
            ..Config::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_zero_slot_size() {
        let config = Config {
            slot_size: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    #[test]
    fn test_validate_zero_reap_window() {
        let config = Config {
            reap_window: 0,
            ..Config::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::ConfigInvalid
        );
    }

    // The from_env cases share environment variables, so they run inside a
    // single test to avoid cross-thread interference.
    #[test]
    fn test_from_env_parsing() {
        {
            let _guard = EnvVarGuard::new(&[
                ("GDS_BATCH_COMPAT_MODE", "ON"),
                ("GDS_BATCH_SIZE", "64"),
                ("GDS_BATCH_SLOT_SIZE", "8192"),
                ("GDS_BATCH_REAP_WINDOW", "8"),
            ]);
            let config = Config::from_env().unwrap();
            assert_eq!(config.compat_mode, CompatMode::On);
            assert_eq!(config.batch_size, 64);
            assert_eq!(config.slot_size, 8192);
            assert_eq!(config.reap_window, 8);
        }

        {
            // Values past the subsystem batch limit are rejected.
            let _guard = EnvVarGuard::new(&[("GDS_BATCH_SIZE", "4096")]);
            let err = Config::from_env().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
        }

        {
            // Empty values fall back to defaults.
            let _guard = EnvVarGuard::new(&[("GDS_BATCH_SLOT_SIZE", "")]);
            let config = Config::from_env().unwrap();
            assert_eq!(config.slot_size, DEFAULT_SLOT_SIZE);
        }
    }

    // set/update both touch the global singleton; one test keeps them
    // ordered.
    #[test]
    fn test_config_singleton_set_and_update() {
        Config::set(Config {
            batch_size: 8,
            reap_window: 2,
            ..Config::default()
        });

        let retrieved = Config::get();
        assert_eq!(retrieved.batch_size, 8);
        assert_eq!(retrieved.reap_window, 2);

        Config::update(|c| {
            c.slot_size = 512;
        });
        let config = Config::get();
        assert_eq!(config.slot_size, 512);

        // Restore default so other tests aren't affected
        Config::set(Config::default());
    }
}
