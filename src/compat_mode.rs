//! Compatibility mode detection and configuration.
//!
//! Determines whether batch transfers go through GPUDirect Storage (the
//! cuFile backend) or fall back to host-staged POSIX I/O.
//!
//! # Detection Logic
//!
//! In `Auto` mode, the environment is probed before committing to GDS:
//! 1. Is `/run/udev` readable? (Required for GDS device detection; absent in
//!    many Docker containers.)
//! 2. Is this WSL? (GDS is not supported on WSL.)
//!
//! The probe only sets the preference. The cuFile driver itself may still
//! refuse to initialize, in which case `Auto` callers fall back to POSIX.

use std::path::Path;

use crate::error::{Error, ErrorKind};

/// Controls whether batch I/O uses GPUDirect Storage or POSIX I/O.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CompatMode {
    /// Enforce GDS. Returns an error if GDS is unavailable.
    Off,
    /// Enforce POSIX I/O. Never attempts GDS.
    On,
    /// Try GDS first, fall back to POSIX if unavailable (default).
    #[default]
    Auto,
}

impl CompatMode {
    /// Parse a compatibility mode from a string.
    ///
    /// Accepts (case-insensitive):
    /// - `"on"`, `"true"`, `"yes"`, `"1"` → [`CompatMode::On`]
    /// - `"off"`, `"false"`, `"no"`, `"0"` → [`CompatMode::Off`]
    /// - `"auto"` → [`CompatMode::Auto`]
    pub fn parse(s: &str) -> crate::error::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "yes" | "1" => Ok(CompatMode::On),
            "off" | "false" | "no" | "0" => Ok(CompatMode::Off),
            "auto" => Ok(CompatMode::Auto),
            _ => Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("unknown compatibility mode: {s:?}"),
            )
            .with_operation("CompatMode::parse")),
        }
    }

    /// Returns `true` if GDS should be used (i.e., mode is not `On`).
    ///
    /// In `Auto` mode, this returns `true` but the caller must still verify
    /// that GDS is actually available.
    pub fn is_gds_preferred(self) -> bool {
        self != CompatMode::On
    }

    /// Returns `true` if this is the POSIX-only compatibility mode.
    pub fn is_compat(self) -> bool {
        self == CompatMode::On
    }
}

impl std::fmt::Display for CompatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompatMode::Off => f.write_str("OFF"),
            CompatMode::On => f.write_str("ON"),
            CompatMode::Auto => f.write_str("AUTO"),
        }
    }
}

/// Check whether the system is running under WSL (Windows Subsystem for Linux).
///
/// GDS is not supported on WSL. Detection checks `/proc/version` for "microsoft".
pub fn is_wsl() -> bool {
    std::fs::read_to_string("/proc/version")
        .map(|v| v.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

/// Check whether `/run/udev` is readable.
///
/// This directory is required for GDS device detection and is absent in many
/// Docker containers.
pub fn is_udev_readable() -> bool {
    Path::new("/run/udev").is_dir()
}

/// Determine the effective compatibility mode for the runtime environment.
///
/// When `mode` is `Auto`, this function probes the system:
/// - If WSL is detected, returns `On` (POSIX fallback).
/// - If `/run/udev` is not readable, returns `On`.
/// - Otherwise returns `Off` (try GDS).
///
/// When `mode` is `On` or `Off`, it is returned unchanged.
pub fn resolve_compat_mode(mode: CompatMode) -> CompatMode {
    match mode {
        CompatMode::On | CompatMode::Off => mode,
        CompatMode::Auto => {
            if is_wsl() || !is_udev_readable() {
                CompatMode::On
            } else {
                CompatMode::Off
            }
        }
    }
}
