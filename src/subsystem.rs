//! The abstracted transfer subsystem interface.
//!
//! The batch protocol (registry, builder, engine, lifecycle) is written
//! against [`TransferSubsystem`] so the same code drives the real cuFile
//! backend, the host-staged POSIX fallback, and scripted test doubles.
//!
//! Handles issued by a subsystem are opaque ids, valid only against the
//! instance that issued them. Driver open/close is the construction and drop
//! of a backend instance: a backend must be created before any registration
//! call and dropped only after every batch it tracks has reached a terminal
//! state.

use std::path::Path;

use crate::batch::BatchSlot;
use crate::error::Result;

/// Maximum number of operations a subsystem tracks per batch.
///
/// Matches the cuFile driver's default batch limit.
pub const MAX_BATCH_ENTRIES: usize = 128;

/// Opaque reference to a registered storage object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageId(pub u32);

/// Opaque reference to a registered accelerator memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub u32);

/// Opaque token owning subsystem-side resources for one in-flight batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchId(pub u32);

/// Terminal state of one completed batch operation.
///
/// Mirrors the cuFile event states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionStatus {
    /// Operation completed successfully.
    Complete,
    /// Operation is still waiting.
    Waiting,
    /// Operation is pending.
    Pending,
    /// Operation was cancelled.
    Canceled,
    /// Operation failed.
    Failed,
    /// Operation timed out.
    Timeout,
    /// Invalid operation.
    #[default]
    Invalid,
}

/// One completion reported by [`TransferSubsystem::batch_poll`].
///
/// The subsystem guarantees each submitted slot yields exactly one
/// `CompletionEvent` over the batch's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionEvent {
    /// The correlation token of the originating slot.
    pub token: u64,
    /// Terminal state of the operation.
    pub status: CompletionStatus,
    /// Number of bytes actually transferred.
    pub bytes_transferred: usize,
}

/// The collaborator interface the batch protocol consumes.
///
/// # Contract
///
/// - `register_*` calls fail without side effects; a returned id stays valid
///   until released.
/// - `batch_submit` is atomic: either the whole slot sequence is accepted or
///   none of it is. A failed submit leaves the batch unrunnable; the caller
///   must proceed to teardown.
/// - `batch_poll` blocks until at least `min_nr` completions are available
///   (with `min_nr = 0` it may return immediately with zero), then copies at
///   most `events.len()` completions into `events` and returns the count.
///   It may legitimately return fewer than the total outstanding.
/// - `batch_destroy` must be called exactly once per id returned by a
///   successful `batch_setup`, and only after the batch reached a terminal
///   state (fully reaped or abandoned on error).
/// - A completion is never lost or duplicated: across a batch's lifetime the
///   per-poll counts sum to exactly the number of submitted slots.
pub trait TransferSubsystem {
    /// Open the storage object at `path` and register it for direct I/O.
    fn register_storage(&mut self, path: &Path) -> Result<StorageId>;

    /// Deregister and close a storage object.
    ///
    /// Must not be called while a batch referencing the handle is in flight.
    fn release_storage(&mut self, id: StorageId) -> Result<()>;

    /// Allocate an accelerator memory region of `len` bytes and register it
    /// with the transfer engine.
    fn register_buffer(&mut self, len: usize) -> Result<BufferId>;

    /// Deregister and free an accelerator memory region.
    ///
    /// Must not be called while a batch referencing the buffer is in flight.
    fn release_buffer(&mut self, id: BufferId) -> Result<()>;

    /// Reserve subsystem tracking resources for a batch of `depth` operations.
    fn batch_setup(&mut self, depth: usize) -> Result<BatchId>;

    /// Hand an ordered slot sequence to the subsystem, atomically.
    fn batch_submit(&mut self, batch: BatchId, slots: &[BatchSlot]) -> Result<()>;

    /// Reap completions into `events`, returning how many were written.
    fn batch_poll(
        &mut self,
        batch: BatchId,
        min_nr: usize,
        events: &mut [CompletionEvent],
    ) -> Result<usize>;

    /// Release subsystem-side tracking for a batch.
    fn batch_destroy(&mut self, batch: BatchId) -> Result<()>;

    /// Upper bound on the number of slots per batch.
    fn max_batch_entries(&self) -> usize {
        MAX_BATCH_ENTRIES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_comparable() {
        assert_eq!(StorageId(3), StorageId(3));
        assert_ne!(BufferId(0), BufferId(1));
        assert_eq!(BatchId(7), BatchId(7));
    }

    #[test]
    fn test_completion_event_default_is_invalid() {
        let event = CompletionEvent::default();
        assert_eq!(event.status, CompletionStatus::Invalid);
        assert_eq!(event.token, 0);
        assert_eq!(event.bytes_transferred, 0);
    }
}
