//! Per-batch resource registration with reverse-order unwinding.
//!
//! A [`ResourceRegistry`] owns the storage handles and accelerator buffers
//! of exactly one batch: one storage handle and one buffer per slot. All
//! registrations must succeed before a batch is built over them; if any
//! registration fails, everything already registered is released in reverse
//! acquisition order before the error propagates, so no partial batch can
//! ever be submitted.
//!
//! Release is best-effort: an individual deregistration failure is logged
//! and never aborts the remaining unwind.

use std::path::Path;

use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::subsystem::{BufferId, StorageId, TransferSubsystem};

/// Tracks the storage handles and buffers registered for one batch.
///
/// Resources are exclusively owned by the batch that registered them and
/// must stay registered until that batch reaches a terminal state.
/// [`release`](ResourceRegistry::release) must therefore only run after the
/// reap loop has exited (or the batch was abandoned on error).
#[derive(Debug)]
pub struct ResourceRegistry {
    storage: Vec<StorageId>,
    buffers: Vec<BufferId>,
}

impl ResourceRegistry {
    /// Register `count` storage handles on `path`, then `count` buffers of
    /// `slot_size` bytes.
    ///
    /// Each slot opens the backing object independently, so every slot holds
    /// an exclusive handle for the batch's duration.
    ///
    /// # Errors
    ///
    /// Propagates the first registration failure after unwinding everything
    /// already registered, in reverse order.
    pub fn acquire<S>(
        subsystem: &mut S,
        path: &Path,
        count: usize,
        slot_size: usize,
    ) -> Result<Self>
    where
        S: TransferSubsystem + ?Sized,
    {
        if count == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "cannot register zero slots")
                    .with_operation("ResourceRegistry::acquire"),
            );
        }

        let mut registry = Self {
            storage: Vec::with_capacity(count),
            buffers: Vec::with_capacity(count),
        };

        for slot in 0..count {
            match subsystem.register_storage(path) {
                Ok(id) => registry.storage.push(id),
                Err(e) => {
                    registry.release(subsystem);
                    return Err(e
                        .with_operation("ResourceRegistry::acquire")
                        .with_context("slot", slot.to_string())
                        .with_context("path", path.display().to_string()));
                }
            }
        }

        for slot in 0..count {
            match subsystem.register_buffer(slot_size) {
                Ok(id) => registry.buffers.push(id),
                Err(e) => {
                    registry.release(subsystem);
                    return Err(e
                        .with_operation("ResourceRegistry::acquire")
                        .with_context("slot", slot.to_string())
                        .with_context("slot_size", slot_size.to_string()));
                }
            }
        }

        Ok(registry)
    }

    /// The per-slot `(storage, buffer)` pairs, in registration order.
    pub fn pairs(&self) -> Vec<(StorageId, BufferId)> {
        self.storage
            .iter()
            .copied()
            .zip(self.buffers.iter().copied())
            .collect()
    }

    /// The registered buffer ids, in registration order.
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }

    /// Number of slots currently registered.
    pub fn len(&self) -> usize {
        self.storage.len().max(self.buffers.len())
    }

    /// Whether everything has been released.
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty() && self.buffers.is_empty()
    }

    /// Release everything still registered: buffers in reverse acquisition
    /// order, then storage handles in reverse acquisition order.
    ///
    /// Idempotent. Individual deregistration failures are logged and never
    /// stop the remaining unwind.
    pub fn release<S>(&mut self, subsystem: &mut S)
    where
        S: TransferSubsystem + ?Sized,
    {
        while let Some(id) = self.buffers.pop() {
            if let Err(e) = subsystem.release_buffer(id) {
                warn!(buffer = id.0, error = %e, "buffer deregistration failed during teardown");
            }
        }
        while let Some(id) = self.storage.pop() {
            if let Err(e) = subsystem.release_storage(id) {
                warn!(storage = id.0, error = %e, "storage release failed during teardown");
            }
        }
    }
}
