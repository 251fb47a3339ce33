//! # gds-batch
//!
//! Batched, asynchronous, direct storage-to-GPU-memory reads with
//! bounded-capacity completion reaping.
//!
//! A fixed-size group of independent read operations is submitted to the
//! transfer subsystem as one unit, then drained through a completion loop
//! whose event buffer is deliberately smaller than the batch: the subsystem
//! is allowed to report fewer completions per call than requested, and the
//! reap loop keeps polling until every submitted operation is accounted for
//! exactly once.
//!
//! ## Architecture
//!
//! The core protocol (descriptor assembly, submission, the reap loop, and
//! resource teardown) is written against the [`TransferSubsystem`] trait, so
//! it runs unchanged over two backends:
//!
//! - **cuFile** (`cufile`, feature `gds`): real GPUDirect Storage transfers
//!   through `cudarc`'s cuFile batch bindings.
//! - **POSIX** (`posix`): a host-staged fallback with opportunistic Direct
//!   I/O, used when GDS is unavailable and by the test suite.
//!
//! Backend selection follows [`CompatMode`]: `Off` enforces GDS, `On`
//! enforces POSIX, and `Auto` (the default) probes the environment.
//!
//! ## Feature Flags
//!
//! - `gds` (default): compiles the cuFile backend. Disable for environments
//!   where the cudarc bindings are unwanted; the POSIX backend and the whole
//!   core remain available.

pub mod align;
pub mod batch;
pub mod compat_mode;
pub mod config;
#[cfg(feature = "gds")]
pub mod cufile;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod posix;
pub mod registry;
pub mod subsystem;

pub use batch::{Batch, BatchOpcode, BatchSlot};
pub use compat_mode::CompatMode;
pub use config::Config;
pub use engine::{BatchEngine, BatchState, DrainSummary};
pub use error::{Error, ErrorKind, ErrorStatus, Result};
pub use lifecycle::{RunReport, run_batch_read};
pub use registry::ResourceRegistry;
pub use subsystem::{
    BatchId, BufferId, CompletionEvent, CompletionStatus, MAX_BATCH_ENTRIES, StorageId,
    TransferSubsystem,
};
