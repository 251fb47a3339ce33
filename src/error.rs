//! Error types for gds-batch.
//!
//! # Design
//!
//! - [`ErrorKind`] categorizes *what* went wrong, and in particular which
//!   stage of the batch protocol rejected the operation.
//! - [`ErrorStatus`] indicates *what to do about it* (retry or not).
//! - [`Error`] combines both with rich context for debugging.
//!
//! Errors are constructed via a fluent builder pattern:
//!
//! ```
//! use gds_batch::error::{Error, ErrorKind};
//!
//! let err = Error::new(ErrorKind::Submit, "batch rejected by subsystem")
//!     .with_operation("BatchEngine::submit")
//!     .with_context("depth", "128");
//! ```
//!
//! Protocol violations (impossible completion counts, duplicate correlation
//! tokens) are not part of this taxonomy: they indicate subsystem corruption
//! and are asserted, never returned.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

/// A specialized `Result` type for gds-batch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes the type of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An unexpected/internal error that should not happen under normal conditions.
    Unexpected,
    /// The requested file or resource was not found.
    NotFound,
    /// Permission denied when accessing a file or resource.
    PermissionDenied,
    /// Invalid configuration or batch construction parameters.
    ConfigInvalid,
    /// Storage or buffer registration/allocation failed.
    Resource,
    /// The subsystem could not reserve tracking state for a batch.
    Setup,
    /// The subsystem refused to accept a submitted batch.
    Submit,
    /// The subsystem faulted while reporting completions.
    Reap,
    /// A POSIX/system call failed.
    SystemError,
    /// A cuFile API call failed.
    CuFileError,
    /// A CUDA operation failed.
    CudaError,
    /// The requested feature is not supported in the current environment.
    Unsupported,
}

impl ErrorKind {
    /// Returns a static string label for this error kind.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unexpected => "Unexpected",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::PermissionDenied => "PermissionDenied",
            ErrorKind::ConfigInvalid => "ConfigInvalid",
            ErrorKind::Resource => "Resource",
            ErrorKind::Setup => "Setup",
            ErrorKind::Submit => "Submit",
            ErrorKind::Reap => "Reap",
            ErrorKind::SystemError => "SystemError",
            ErrorKind::CuFileError => "CuFileError",
            ErrorKind::CudaError => "CudaError",
            ErrorKind::Unsupported => "Unsupported",
        }
    }

    /// Whether to capture a backtrace for this error kind.
    ///
    /// Capturing a backtrace is expensive at runtime. We only capture it for
    /// kinds where the call site is likely to be surprising (e.g., `Unexpected`).
    fn enable_backtrace(&self) -> bool {
        matches!(self, ErrorKind::Unexpected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Indicates whether the caller should retry the operation.
///
/// The core performs no retries itself; this is advisory for callers layered
/// above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorStatus {
    /// The error is permanent and should not be retried.
    Permanent,
    /// The error is transient and may succeed on retry.
    Temporary,
    /// The error was transient but persisted after retry attempts.
    /// Should not be retried again.
    Persistent,
}

impl fmt::Display for ErrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorStatus::Permanent => f.write_str("permanent"),
            ErrorStatus::Temporary => f.write_str("temporary"),
            ErrorStatus::Persistent => f.write_str("persistent"),
        }
    }
}

/// The main error type for gds-batch.
pub struct Error {
    kind: ErrorKind,
    message: String,
    status: ErrorStatus,
    operation: &'static str,
    context: Vec<(&'static str, String)>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    backtrace: Option<Box<Backtrace>>,
}

impl Error {
    /// Create a new error with the given kind and message.
    ///
    /// Defaults to `ErrorStatus::Permanent` and empty operation/context.
    ///
    /// For [`ErrorKind::Unexpected`], a backtrace is captured if `RUST_BACKTRACE`
    /// is enabled. For other kinds, backtrace capture is skipped to avoid the
    /// runtime cost.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: ErrorStatus::Permanent,
            operation: "",
            context: Vec::new(),
            source: None,
            // `Backtrace::capture()` checks if backtrace is enabled internally.
            // It's zero cost when `RUST_BACKTRACE` is not set.
            backtrace: kind
                .enable_backtrace()
                .then(Backtrace::capture)
                .filter(|bt| bt.status() == BacktraceStatus::Captured)
                .map(Box::new),
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error status.
    pub fn status(&self) -> ErrorStatus {
        self.status
    }

    /// Returns the operation that caused this error.
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Returns the human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the error context as key-value pairs.
    pub fn context_iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.context.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Returns `true` if this error is permanent.
    pub fn is_permanent(&self) -> bool {
        self.status == ErrorStatus::Permanent
    }

    /// Returns `true` if this error is temporary (retryable).
    pub fn is_temporary(&self) -> bool {
        self.status == ErrorStatus::Temporary
    }

    /// Set the error status to temporary. Consumes and returns self.
    pub fn set_temporary(mut self) -> Self {
        self.status = ErrorStatus::Temporary;
        self
    }

    /// Set the error status to persistent. Consumes and returns self.
    pub fn set_persistent(mut self) -> Self {
        self.status = ErrorStatus::Persistent;
        self
    }

    /// Set the operation that caused this error.
    ///
    /// If the error already has an operation, the previous one is pushed
    /// into context as `("called", previous_operation)`.
    pub fn with_operation(mut self, operation: &'static str) -> Self {
        if !self.operation.is_empty() {
            self.context.push(("called", self.operation.to_string()));
        }
        self.operation = operation;
        self
    }

    /// Add a key-value context pair.
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    /// Set the underlying source error.
    pub fn set_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the captured backtrace, if any.
    ///
    /// Backtraces are only captured for [`ErrorKind::Unexpected`] and only when
    /// `RUST_BACKTRACE=1` (or `full`) is set.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_deref()
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            // Struct-style debug output
            let mut d = f.debug_struct("Error");
            d.field("kind", &self.kind);
            d.field("message", &self.message);
            d.field("status", &self.status);
            d.field("operation", &self.operation);
            d.field("context", &self.context);
            d.field("source", &self.source.as_ref().map(|s| s.to_string()));
            d.finish()
        } else {
            // Multi-line debug output
            writeln!(
                f,
                "{} ({}) at {} => {}",
                self.kind, self.status, self.operation, self.message
            )?;
            if !self.context.is_empty() {
                writeln!(f)?;
                writeln!(f, "Context:")?;
                for (k, v) in &self.context {
                    writeln!(f, "   {k}: {v}")?;
                }
            }
            if let Some(source) = &self.source {
                writeln!(f)?;
                writeln!(f, "Source:")?;
                writeln!(f, "   {source}")?;
            }
            if let Some(backtrace) = &self.backtrace {
                writeln!(f)?;
                writeln!(f, "Backtrace:")?;
                writeln!(f, "{backtrace}")?;
            }
            Ok(())
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.kind, self.status, self.operation)?;
        if !self.context.is_empty() {
            write!(f, ", context: {{ ")?;
            for (i, (k, v)) in self.context.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            write!(f, " }}")?;
        }
        write!(f, " => {}", self.message)?;
        if let Some(source) = &self.source {
            write!(f, ", source: {source}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        let kind = match err.kind() {
            ErrorKind::NotFound => std::io::ErrorKind::NotFound,
            ErrorKind::PermissionDenied => std::io::ErrorKind::PermissionDenied,
            ErrorKind::Unsupported => std::io::ErrorKind::Unsupported,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}
