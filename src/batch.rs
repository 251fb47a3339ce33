//! Batch descriptor assembly.
//!
//! A [`Batch`] is an immutable, ordered sequence of [`BatchSlot`] descriptors
//! built from the resources a [`ResourceRegistry`](crate::ResourceRegistry)
//! registered. Assembly is pure: no I/O happens here.
//!
//! Offsets are assigned deterministically so each slot addresses a disjoint
//! region of the backing object, and each slot's correlation token is its own
//! position in the batch, so a completion maps back to its slot without a
//! lookup table.

use crate::error::{Error, ErrorKind, Result};
use crate::subsystem::{BufferId, StorageId};

/// Direction of a batch I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOpcode {
    /// Read from storage into accelerator memory.
    Read,
    /// Write from accelerator memory to storage.
    ///
    /// Retained for descriptor completeness; the backends in this crate do
    /// not accept write batches.
    Write,
}

/// One logical I/O operation within a batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchSlot {
    /// Registered storage object to transfer from. Exclusive to this slot
    /// for the batch's duration.
    pub storage: StorageId,
    /// Registered accelerator memory region to transfer into. Valid only
    /// while registered.
    pub buffer: BufferId,
    /// Byte offset into the storage object.
    pub file_offset: u64,
    /// Byte offset into the buffer.
    pub buffer_offset: u64,
    /// Number of bytes to transfer.
    pub len: usize,
    /// Direction of the transfer.
    pub opcode: BatchOpcode,
    /// Caller-chosen value returned alongside this slot's completion.
    /// Unique within the batch.
    pub token: u64,
}

/// An immutable, ordered sequence of slots submitted and reaped as one unit.
///
/// Cardinality is fixed at build time and validated against the subsystem's
/// batch limit. Once submitted, slots are never mutated.
#[derive(Debug)]
pub struct Batch {
    slots: Vec<BatchSlot>,
}

impl Batch {
    /// Assemble a read batch over `pairs` of registered resources.
    ///
    /// Slot `i` reads `slot_size` bytes from file offset `i * slot_size`
    /// into buffer offset 0, with correlation token `i`. Each slot therefore
    /// addresses a region of the backing object disjoint from every other
    /// slot's.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if `pairs` is empty, exceeds `max_entries`, or
    /// `slot_size` is zero.
    pub fn reads(
        pairs: &[(StorageId, BufferId)],
        slot_size: usize,
        max_entries: usize,
    ) -> Result<Self> {
        if pairs.is_empty() {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "cannot build an empty batch")
                    .with_operation("Batch::reads"),
            );
        }
        if pairs.len() > max_entries {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!(
                    "batch of {} slots exceeds the subsystem limit of {max_entries}",
                    pairs.len()
                ),
            )
            .with_operation("Batch::reads"));
        }
        if slot_size == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "slot size must be non-zero")
                    .with_operation("Batch::reads"),
            );
        }

        let slots = pairs
            .iter()
            .enumerate()
            .map(|(i, &(storage, buffer))| BatchSlot {
                storage,
                buffer,
                file_offset: (i * slot_size) as u64,
                buffer_offset: 0,
                len: slot_size,
                opcode: BatchOpcode::Read,
                token: i as u64,
            })
            .collect();

        Ok(Self { slots })
    }

    /// Number of slots in the batch.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// A batch is never empty; this exists for clippy symmetry.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The ordered slot descriptors.
    pub fn slots(&self) -> &[BatchSlot] {
        &self.slots
    }
}
