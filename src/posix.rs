//! Host-staged POSIX backend.
//!
//! Implements [`TransferSubsystem`] without a GPU: "device" buffers are
//! page-aligned host allocations, and batch reads are served with `pread`,
//! using Direct I/O opportunistically when the slot geometry allows it.
//! Transfers complete eagerly at submit time and are handed back
//! incrementally at poll time, at most one event buffer's worth per call,
//! so the bounded reap loop is exercised exactly as it is against the real
//! driver.
//!
//! This is the compatibility path selected by `CompatMode::On`, and the
//! backend the test suite runs against.

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;

use crate::align::{is_aligned, is_aligned_ptr, page_size};
use crate::batch::{BatchOpcode, BatchSlot};
use crate::error::{Error, ErrorKind, Result};
use crate::subsystem::{
    BatchId, BufferId, CompletionEvent, CompletionStatus, StorageId, TransferSubsystem,
};

/// A page-aligned host allocation standing in for device memory.
struct HostBuffer {
    ptr: *mut u8,
    len: usize,
}

impl HostBuffer {
    /// Allocate `len` zeroed bytes, page-aligned so Direct I/O can target
    /// the buffer without staging.
    fn alloc(len: usize) -> Result<Self> {
        let ps = page_size();
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        // SAFETY: ps is a power of two and a multiple of sizeof(void*).
        let ret = unsafe { libc::posix_memalign(&mut ptr, ps, len) };
        if ret != 0 || ptr.is_null() {
            return Err(Error::new(
                ErrorKind::Resource,
                format!("posix_memalign failed for {len} bytes"),
            ));
        }
        // SAFETY: ptr is valid for len bytes.
        unsafe { std::ptr::write_bytes(ptr as *mut u8, 0, len) };
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by posix_memalign.
        unsafe { libc::free(self.ptr as *mut libc::c_void) };
    }
}

// SAFETY: The buffer is solely owned and not aliased.
unsafe impl Send for HostBuffer {}

/// Dual file descriptors for one registered storage object: one opened with
/// `O_DIRECT` (best-effort, -1 if the filesystem refuses it) and one without.
struct PosixStorage {
    fd_direct_on: RawFd,
    fd_direct_off: RawFd,
}

/// Tracking state for one batch.
struct PosixBatch {
    depth: usize,
    submitted: bool,
    pending: VecDeque<CompletionEvent>,
}

/// Host-staged [`TransferSubsystem`].
///
/// Driver open/close is the construction and drop of the instance; there is
/// no process-wide state.
#[derive(Default)]
pub struct PosixSubsystem {
    storage: Vec<Option<PosixStorage>>,
    buffers: Vec<Option<HostBuffer>>,
    batches: Vec<Option<PosixBatch>>,
}

impl PosixSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of a registered buffer, for verification after a drain.
    ///
    /// Only meaningful while the buffer is still registered, i.e. before the
    /// owning batch's resources are released.
    pub fn buffer_contents(&self, id: BufferId) -> Result<&[u8]> {
        self.lookup_buffer(id).map(HostBuffer::as_slice)
    }

    fn lookup_storage(&self, id: StorageId) -> Result<&PosixStorage> {
        self.storage
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown storage handle {}", id.0))
                    .with_operation("PosixSubsystem")
            })
    }

    fn lookup_buffer(&self, id: BufferId) -> Result<&HostBuffer> {
        self.buffers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown buffer {}", id.0))
                    .with_operation("PosixSubsystem")
            })
    }

    fn lookup_batch_mut(&mut self, id: BatchId) -> Result<&mut PosixBatch> {
        self.batches
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown batch handle {}", id.0))
                    .with_operation("PosixSubsystem")
            })
    }

    /// Serve one read slot, returning its completion event.
    ///
    /// Per-operation I/O faults surface in the event status, not as an
    /// error: a submitted batch always yields one completion per slot.
    fn read_slot(&self, slot: &BatchSlot) -> CompletionEvent {
        // Validation in batch_submit guarantees both lookups succeed and the
        // slot range fits the buffer.
        let storage = self.storage[slot.storage.0 as usize].as_ref().unwrap();
        let ps = page_size();

        let buffer = self.buffers[slot.buffer.0 as usize].as_ref().unwrap();
        // SAFETY: buffer_offset + len <= buffer.len was validated at submit.
        let dst = unsafe { buffer.ptr.add(slot.buffer_offset as usize) };

        // Direct I/O only when every part of the transfer is page-aligned;
        // everything else goes through the buffered descriptor.
        let aligned = is_aligned(slot.file_offset as usize, ps)
            && is_aligned(slot.len, ps)
            && is_aligned_ptr(dst, ps);
        let fd = if aligned && storage.fd_direct_on >= 0 {
            storage.fd_direct_on
        } else {
            storage.fd_direct_off
        };

        let mut transferred = 0usize;
        while transferred < slot.len {
            let ret = unsafe {
                // SAFETY: dst + transferred stays inside the validated
                // buffer range; fd is open for reading.
                libc::pread(
                    fd,
                    dst.add(transferred) as *mut libc::c_void,
                    slot.len - transferred,
                    (slot.file_offset + transferred as u64) as libc::off_t,
                )
            };
            if ret < 0 {
                return CompletionEvent {
                    token: slot.token,
                    status: CompletionStatus::Failed,
                    bytes_transferred: transferred,
                };
            }
            if ret == 0 {
                // EOF: a short read, not a fault.
                break;
            }
            transferred += ret as usize;
        }

        CompletionEvent {
            token: slot.token,
            status: CompletionStatus::Complete,
            bytes_transferred: transferred,
        }
    }
}

impl TransferSubsystem for PosixSubsystem {
    fn register_storage(&mut self, path: &Path) -> Result<StorageId> {
        let flags = libc::O_RDWR | libc::O_CREAT;
        let fd_direct_off = posix_open(path, flags, 0o664)
            .map_err(|e| e.with_operation("PosixSubsystem::register_storage"))?;
        // O_DIRECT may be refused by the filesystem (tmpfs, some overlays).
        let fd_direct_on = posix_open(path, flags | libc::O_DIRECT, 0o664).unwrap_or(-1);

        let id = StorageId(self.storage.len() as u32);
        self.storage.push(Some(PosixStorage {
            fd_direct_on,
            fd_direct_off,
        }));
        Ok(id)
    }

    fn release_storage(&mut self, id: StorageId) -> Result<()> {
        let slot = self
            .storage
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown storage handle {}", id.0))
                    .with_operation("PosixSubsystem::release_storage")
            })?;
        // SAFETY: the descriptors were opened by register_storage and are
        // closed exactly once here.
        unsafe {
            if slot.fd_direct_on >= 0 {
                libc::close(slot.fd_direct_on);
            }
            libc::close(slot.fd_direct_off);
        }
        Ok(())
    }

    fn register_buffer(&mut self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "buffer length must be non-zero")
                    .with_operation("PosixSubsystem::register_buffer"),
            );
        }
        let buffer =
            HostBuffer::alloc(len).map_err(|e| e.with_operation("PosixSubsystem::register_buffer"))?;
        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(Some(buffer));
        Ok(id)
    }

    fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        self.buffers
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .map(drop)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown buffer {}", id.0))
                    .with_operation("PosixSubsystem::release_buffer")
            })
    }

    fn batch_setup(&mut self, depth: usize) -> Result<BatchId> {
        if depth == 0 || depth > self.max_batch_entries() {
            return Err(Error::new(
                ErrorKind::Setup,
                format!("cannot reserve tracking for a batch of {depth}"),
            )
            .with_operation("PosixSubsystem::batch_setup"));
        }
        let id = BatchId(self.batches.len() as u32);
        self.batches.push(Some(PosixBatch {
            depth,
            submitted: false,
            pending: VecDeque::with_capacity(depth),
        }));
        Ok(id)
    }

    fn batch_submit(&mut self, batch: BatchId, slots: &[BatchSlot]) -> Result<()> {
        {
            let tracked = self.lookup_batch_mut(batch)?;
            if tracked.submitted {
                return Err(
                    Error::new(ErrorKind::Submit, "batch was already submitted")
                        .with_operation("PosixSubsystem::batch_submit"),
                );
            }
            if slots.len() > tracked.depth {
                return Err(Error::new(
                    ErrorKind::Submit,
                    format!(
                        "{} slots exceed the reserved depth of {}",
                        slots.len(),
                        tracked.depth
                    ),
                )
                .with_operation("PosixSubsystem::batch_submit"));
            }
        }

        // Validate the whole batch before touching any file: acceptance is
        // atomic, so a bad slot must leave no partially executed state.
        for slot in slots {
            if slot.opcode != BatchOpcode::Read {
                return Err(
                    Error::new(ErrorKind::Unsupported, "write batches are not supported")
                        .with_operation("PosixSubsystem::batch_submit"),
                );
            }
            self.lookup_storage(slot.storage)?;
            let buffer = self.lookup_buffer(slot.buffer)?;
            let end = slot.buffer_offset as usize + slot.len;
            if end > buffer.len {
                return Err(Error::new(
                    ErrorKind::Submit,
                    format!(
                        "slot {} transfer of {} bytes at offset {} exceeds buffer of {}",
                        slot.token, slot.len, slot.buffer_offset, buffer.len
                    ),
                )
                .with_operation("PosixSubsystem::batch_submit"));
            }
        }

        let events: Vec<CompletionEvent> = slots.iter().map(|s| self.read_slot(s)).collect();

        let tracked = self.lookup_batch_mut(batch)?;
        tracked.pending.extend(events);
        tracked.submitted = true;
        Ok(())
    }

    fn batch_poll(
        &mut self,
        batch: BatchId,
        min_nr: usize,
        events: &mut [CompletionEvent],
    ) -> Result<usize> {
        let tracked = self.lookup_batch_mut(batch)?;
        if !tracked.submitted {
            return Err(
                Error::new(ErrorKind::Reap, "batch polled before submission")
                    .with_operation("PosixSubsystem::batch_poll"),
            );
        }
        // Everything completed at submit time, so a min_nr above the
        // outstanding count could never be satisfied. The real driver's
        // behavior there is unspecified; we refuse instead of blocking.
        if min_nr > tracked.pending.len() {
            return Err(Error::new(
                ErrorKind::Reap,
                format!(
                    "min_nr {min_nr} exceeds the {} outstanding completions",
                    tracked.pending.len()
                ),
            )
            .with_operation("PosixSubsystem::batch_poll"));
        }

        let count = events.len().min(tracked.pending.len());
        for slot in events.iter_mut().take(count) {
            *slot = tracked.pending.pop_front().expect("pending count checked");
        }
        Ok(count)
    }

    fn batch_destroy(&mut self, batch: BatchId) -> Result<()> {
        // Dropping the tracking discards any unreaped completions; the
        // engine only destroys in a terminal state, where the batch is
        // either fully reaped or abandoned.
        self.batches
            .get_mut(batch.0 as usize)
            .and_then(Option::take)
            .map(drop)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown batch handle {}", batch.0))
                    .with_operation("PosixSubsystem::batch_destroy")
            })
    }
}

impl Drop for PosixSubsystem {
    fn drop(&mut self) {
        // Close any descriptors the caller leaked past release_storage.
        for slot in self.storage.iter_mut().filter_map(Option::take) {
            // SAFETY: descriptors are owned by this instance.
            unsafe {
                if slot.fd_direct_on >= 0 {
                    libc::close(slot.fd_direct_on);
                }
                libc::close(slot.fd_direct_off);
            }
        }
    }
}

/// Open `path` with the given flags, mapping errno to an error kind.
fn posix_open(path: &Path, flags: i32, mode: u32) -> Result<RawFd> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes()).map_err(|_| {
        Error::new(
            ErrorKind::ConfigInvalid,
            format!("path contains a NUL byte: {}", path.display()),
        )
    })?;

    // SAFETY: c_path is a valid NUL-terminated string.
    let fd = unsafe { libc::open(c_path.as_ptr(), flags, mode as libc::mode_t) };
    if fd < 0 {
        // SAFETY: errno location is always valid.
        let errno = unsafe { *libc::__errno_location() };
        let kind = match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EACCES | libc::EPERM => ErrorKind::PermissionDenied,
            _ => ErrorKind::SystemError,
        };
        return Err(Error::new(
            kind,
            format!(
                "open failed: {}",
                std::io::Error::from_raw_os_error(errno)
            ),
        )
        .with_context("path", path.display().to_string()));
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pattern_file(len: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();
        file
    }

    fn read_slot(storage: StorageId, buffer: BufferId, index: usize, len: usize) -> BatchSlot {
        BatchSlot {
            storage,
            buffer,
            file_offset: (index * len) as u64,
            buffer_offset: 0,
            len,
            opcode: BatchOpcode::Read,
            token: index as u64,
        }
    }

    #[test]
    fn test_register_and_release_storage() {
        let file = pattern_file(4096);
        let mut sub = PosixSubsystem::new();

        let id = sub.register_storage(file.path()).unwrap();
        sub.release_storage(id).unwrap();

        // Double release is a contract violation surfaced as an error.
        let err = sub.release_storage(id).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
    }

    #[test]
    fn test_register_storage_missing_file() {
        let mut sub = PosixSubsystem::new();
        // O_CREAT means only an unreachable directory fails.
        let err = sub
            .register_storage(Path::new("/nonexistent-dir/f.bin"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_register_buffer_rejects_zero_len() {
        let mut sub = PosixSubsystem::new();
        let err = sub.register_buffer(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigInvalid);
    }

    #[test]
    fn test_buffers_are_page_aligned_and_zeroed() {
        let mut sub = PosixSubsystem::new();
        let id = sub.register_buffer(4096).unwrap();
        let contents = sub.buffer_contents(id).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents.iter().all(|&b| b == 0));
        assert!(is_aligned_ptr(contents.as_ptr(), page_size()));
        sub.release_buffer(id).unwrap();
    }

    #[test]
    fn test_submit_and_poll_reads_pattern() {
        let slot_size = 4096;
        let file = pattern_file(4 * slot_size);
        let mut sub = PosixSubsystem::new();

        let mut slots = Vec::new();
        for i in 0..4 {
            let storage = sub.register_storage(file.path()).unwrap();
            let buffer = sub.register_buffer(slot_size).unwrap();
            slots.push(read_slot(storage, buffer, i, slot_size));
        }

        let batch = sub.batch_setup(4).unwrap();
        sub.batch_submit(batch, &slots).unwrap();

        let mut events = [CompletionEvent::default(); 2];
        let mut reaped = 0;
        let mut polls = 0;
        while reaped < 4 {
            let count = sub.batch_poll(batch, 0, &mut events).unwrap();
            assert!(count <= events.len());
            for event in &events[..count] {
                assert_eq!(event.status, CompletionStatus::Complete);
                assert_eq!(event.bytes_transferred, slot_size);
            }
            reaped += count;
            polls += 1;
        }
        assert_eq!(polls, 2);

        for (i, slot) in slots.iter().enumerate() {
            let contents = sub.buffer_contents(slot.buffer).unwrap();
            let expected: Vec<u8> = (i * slot_size..(i + 1) * slot_size)
                .map(|b| (b % 256) as u8)
                .collect();
            assert_eq!(contents, &expected[..]);
        }

        sub.batch_destroy(batch).unwrap();
    }

    #[test]
    fn test_poll_is_bounded_by_event_buffer() {
        let slot_size = 512;
        let file = pattern_file(8 * slot_size);
        let mut sub = PosixSubsystem::new();

        let mut slots = Vec::new();
        for i in 0..8 {
            let storage = sub.register_storage(file.path()).unwrap();
            let buffer = sub.register_buffer(slot_size).unwrap();
            slots.push(read_slot(storage, buffer, i, slot_size));
        }

        let batch = sub.batch_setup(8).unwrap();
        sub.batch_submit(batch, &slots).unwrap();

        let mut events = [CompletionEvent::default(); 3];
        let counts: Vec<usize> = (0..3)
            .map(|_| sub.batch_poll(batch, 0, &mut events).unwrap())
            .collect();
        assert_eq!(counts, vec![3, 3, 2]);

        // Drained: further polls report nothing.
        assert_eq!(sub.batch_poll(batch, 0, &mut events).unwrap(), 0);
        sub.batch_destroy(batch).unwrap();
    }

    #[test]
    fn test_short_read_past_eof() {
        let slot_size = 4096;
        // Only half the second slot's region exists.
        let file = pattern_file(slot_size + slot_size / 2);
        let mut sub = PosixSubsystem::new();

        let mut slots = Vec::new();
        for i in 0..2 {
            let storage = sub.register_storage(file.path()).unwrap();
            let buffer = sub.register_buffer(slot_size).unwrap();
            slots.push(read_slot(storage, buffer, i, slot_size));
        }

        let batch = sub.batch_setup(2).unwrap();
        sub.batch_submit(batch, &slots).unwrap();

        let mut events = [CompletionEvent::default(); 2];
        let count = sub.batch_poll(batch, 0, &mut events).unwrap();
        assert_eq!(count, 2);
        assert_eq!(events[0].bytes_transferred, slot_size);
        assert_eq!(events[1].bytes_transferred, slot_size / 2);
        assert_eq!(events[1].status, CompletionStatus::Complete);
        sub.batch_destroy(batch).unwrap();
    }

    #[test]
    fn test_write_batches_rejected() {
        let file = pattern_file(4096);
        let mut sub = PosixSubsystem::new();
        let storage = sub.register_storage(file.path()).unwrap();
        let buffer = sub.register_buffer(4096).unwrap();

        let mut slot = read_slot(storage, buffer, 0, 4096);
        slot.opcode = BatchOpcode::Write;

        let batch = sub.batch_setup(1).unwrap();
        let err = sub.batch_submit(batch, &[slot]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        // Atomicity: the rejected batch can still be destroyed cleanly and
        // was never marked submitted.
        let mut events = [CompletionEvent::default(); 1];
        let err = sub.batch_poll(batch, 0, &mut events).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reap);
        sub.batch_destroy(batch).unwrap();
    }

    #[test]
    fn test_submit_rejects_oversized_slot_range() {
        let file = pattern_file(4096);
        let mut sub = PosixSubsystem::new();
        let storage = sub.register_storage(file.path()).unwrap();
        let buffer = sub.register_buffer(1024).unwrap();

        let slot = read_slot(storage, buffer, 0, 4096);
        let batch = sub.batch_setup(1).unwrap();
        let err = sub.batch_submit(batch, &[slot]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Submit);
    }

    #[test]
    fn test_double_submit_rejected() {
        let file = pattern_file(4096);
        let mut sub = PosixSubsystem::new();
        let storage = sub.register_storage(file.path()).unwrap();
        let buffer = sub.register_buffer(4096).unwrap();
        let slot = read_slot(storage, buffer, 0, 4096);

        let batch = sub.batch_setup(1).unwrap();
        sub.batch_submit(batch, &[slot]).unwrap();
        let err = sub.batch_submit(batch, &[slot]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Submit);
    }

    #[test]
    fn test_min_nr_above_outstanding_is_refused() {
        let file = pattern_file(4096);
        let mut sub = PosixSubsystem::new();
        let storage = sub.register_storage(file.path()).unwrap();
        let buffer = sub.register_buffer(4096).unwrap();
        let slot = read_slot(storage, buffer, 0, 4096);

        let batch = sub.batch_setup(1).unwrap();
        sub.batch_submit(batch, &[slot]).unwrap();

        let mut events = [CompletionEvent::default(); 4];
        let err = sub.batch_poll(batch, 2, &mut events).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reap);
    }

    #[test]
    fn test_batch_setup_rejects_oversized_depth() {
        let mut sub = PosixSubsystem::new();
        let err = sub.batch_setup(129).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
        let err = sub.batch_setup(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
    }

    #[test]
    fn test_batch_destroy_exactly_once() {
        let mut sub = PosixSubsystem::new();
        let batch = sub.batch_setup(1).unwrap();
        sub.batch_destroy(batch).unwrap();
        let err = sub.batch_destroy(batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unexpected);
    }
}
