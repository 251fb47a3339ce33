//! GPUDirect Storage backend over cudarc's cuFile bindings.
//!
//! Implements [`TransferSubsystem`] with real direct transfers: storage
//! objects are opened `O_DIRECT` and registered with the cuFile driver,
//! buffers are device allocations registered via `cuFileBufRegister`, and
//! the batch operations map onto the result-level batch API.
//!
//! # Safety Invariants
//!
//! The batch I/O APIs in cudarc are exposed only at the `result` (unsafe)
//! level. This module wraps them with the following validation:
//! - every slot's storage and buffer id resolves to a live registration
//! - slot transfer ranges fit their buffer
//! - `slots.len()` never exceeds the depth reserved at setup
//!
//! Driver open happens in [`CufileSubsystem::new`]; dropping the instance
//! closes the driver after best-effort destruction of any leftover batch
//! tracking.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use cudarc::cufile::result::{batch_io_destroy, batch_io_get_status, batch_io_setup, batch_io_submit};
use cudarc::cufile::sys::{
    CUfileBatchHandle_t, CUfileBatchMode_t, CUfileIOEvents_t,
    CUfileIOParams__bindgen_ty_1__bindgen_ty_1, CUfileIOParams_t, CUfileOpcode, CUfileStatus_t,
    timespec,
};
use cudarc::cufile::{Cufile, FileHandle};
use cudarc::driver::{CudaContext, CudaSlice, CudaStream, DevicePtr};

use crate::batch::{BatchOpcode, BatchSlot};
use crate::error::{Error, ErrorKind, Result};
use crate::subsystem::{
    BatchId, BufferId, CompletionEvent, CompletionStatus, StorageId, TransferSubsystem,
};

/// Tracking state for one cuFile batch.
struct CufileBatch {
    handle: CUfileBatchHandle_t,
    depth: usize,
}

/// GPUDirect Storage [`TransferSubsystem`].
pub struct CufileSubsystem {
    driver: Arc<Cufile>,
    stream: Arc<CudaStream>,
    // Keeps the CUDA context alive for the buffers' lifetime.
    _ctx: Arc<CudaContext>,
    storage: Vec<Option<FileHandle>>,
    buffers: Vec<Option<CudaSlice<u8>>>,
    batches: Vec<Option<CufileBatch>>,
}

impl CufileSubsystem {
    /// Bind the CUDA device at `ordinal` and open the cuFile driver.
    pub fn new(ordinal: usize) -> Result<Self> {
        let ctx = CudaContext::new(ordinal).map_err(|e| {
            Error::new(
                ErrorKind::CudaError,
                format!("failed to initialize CUDA device {ordinal}: {e}"),
            )
            .with_operation("CufileSubsystem::new")
        })?;
        let stream = ctx.default_stream();

        let driver = Cufile::new().map_err(|e| {
            Error::new(
                ErrorKind::CuFileError,
                format!("failed to open the cuFile driver: {e}"),
            )
            .with_operation("CufileSubsystem::new")
        })?;

        Ok(Self {
            driver,
            stream,
            _ctx: ctx,
            storage: Vec::new(),
            buffers: Vec::new(),
            batches: Vec::new(),
        })
    }

    fn storage_handle(&self, id: StorageId) -> Result<&FileHandle> {
        self.storage
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown storage handle {}", id.0))
                    .with_operation("CufileSubsystem")
            })
    }

    fn buffer_slice(&self, id: BufferId) -> Result<&CudaSlice<u8>> {
        self.buffers
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown buffer {}", id.0))
                    .with_operation("CufileSubsystem")
            })
    }
}

impl TransferSubsystem for CufileSubsystem {
    fn register_storage(&mut self, path: &Path) -> Result<StorageId> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o664)
            .custom_flags(libc::O_DIRECT)
            .open(path)
            .map_err(|e| {
                let kind = match e.kind() {
                    std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                    std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                    _ => ErrorKind::SystemError,
                };
                Error::new(kind, format!("failed to open file for cuFile: {e}"))
                    .with_operation("CufileSubsystem::register_storage")
                    .with_context("path", path.display().to_string())
                    .set_source(e)
            })?;

        let handle = self.driver.register(file).map_err(|e| {
            Error::new(
                ErrorKind::Resource,
                format!("cuFile handle registration failed: {e}"),
            )
            .with_operation("CufileSubsystem::register_storage")
            .with_context("path", path.display().to_string())
        })?;

        let id = StorageId(self.storage.len() as u32);
        self.storage.push(Some(handle));
        Ok(id)
    }

    fn release_storage(&mut self, id: StorageId) -> Result<()> {
        // The cuFile handle deregisters and the descriptor closes on drop.
        self.storage
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .map(drop)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown storage handle {}", id.0))
                    .with_operation("CufileSubsystem::release_storage")
            })
    }

    fn register_buffer(&mut self, len: usize) -> Result<BufferId> {
        if len == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "buffer length must be non-zero")
                    .with_operation("CufileSubsystem::register_buffer"),
            );
        }

        let slice = self.stream.alloc_zeros::<u8>(len).map_err(|e| {
            Error::new(
                ErrorKind::Resource,
                format!("device allocation of {len} bytes failed: {e}"),
            )
            .with_operation("CufileSubsystem::register_buffer")
        })?;

        self.driver.buf_register(&slice).map_err(|e| {
            Error::new(
                ErrorKind::Resource,
                format!("cuFile buffer registration failed: {e}"),
            )
            .with_operation("CufileSubsystem::register_buffer")
        })?;

        let id = BufferId(self.buffers.len() as u32);
        self.buffers.push(Some(slice));
        Ok(id)
    }

    fn release_buffer(&mut self, id: BufferId) -> Result<()> {
        let slice = self
            .buffers
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown buffer {}", id.0))
                    .with_operation("CufileSubsystem::release_buffer")
            })?;

        let result = self.driver.buf_deregister(&slice).map_err(|e| {
            Error::new(
                ErrorKind::CuFileError,
                format!("cuFile buffer deregistration failed: {e}"),
            )
            .with_operation("CufileSubsystem::release_buffer")
        });
        // The device memory is freed regardless of the deregistration result.
        drop(slice);
        result
    }

    fn batch_setup(&mut self, depth: usize) -> Result<BatchId> {
        if depth == 0 || depth > self.max_batch_entries() {
            return Err(Error::new(
                ErrorKind::Setup,
                format!("cannot reserve tracking for a batch of {depth}"),
            )
            .with_operation("CufileSubsystem::batch_setup"));
        }

        let handle = batch_io_setup(depth as u32).map_err(|e| {
            Error::new(ErrorKind::Setup, format!("batch_io_setup failed: {e}"))
                .with_operation("CufileSubsystem::batch_setup")
                .with_context("depth", depth.to_string())
        })?;

        let id = BatchId(self.batches.len() as u32);
        self.batches.push(Some(CufileBatch { handle, depth }));
        Ok(id)
    }

    fn batch_submit(&mut self, batch: BatchId, slots: &[BatchSlot]) -> Result<()> {
        let (handle, depth) = {
            let tracked = self
                .batches
                .get(batch.0 as usize)
                .and_then(Option::as_ref)
                .ok_or_else(|| {
                    Error::new(ErrorKind::Unexpected, format!("unknown batch handle {}", batch.0))
                        .with_operation("CufileSubsystem::batch_submit")
                })?;
            (tracked.handle, tracked.depth)
        };

        if slots.len() > depth {
            return Err(Error::new(
                ErrorKind::Submit,
                format!("{} slots exceed the reserved depth of {depth}", slots.len()),
            )
            .with_operation("CufileSubsystem::batch_submit"));
        }

        // Validate every slot before building the parameter array so a bad
        // descriptor never reaches the driver.
        for slot in slots {
            if slot.opcode != BatchOpcode::Read {
                return Err(
                    Error::new(ErrorKind::Unsupported, "write batches are not supported")
                        .with_operation("CufileSubsystem::batch_submit"),
                );
            }
            self.storage_handle(slot.storage)?;
            let slice = self.buffer_slice(slot.buffer)?;
            if slot.buffer_offset as usize + slot.len > slice.num_bytes() {
                return Err(Error::new(
                    ErrorKind::Submit,
                    format!(
                        "slot {} transfer of {} bytes at offset {} exceeds buffer of {}",
                        slot.token,
                        slot.len,
                        slot.buffer_offset,
                        slice.num_bytes()
                    ),
                )
                .with_operation("CufileSubsystem::batch_submit"));
            }
        }

        let params: Vec<CUfileIOParams_t> = slots
            .iter()
            .map(|slot| {
                let fh = self.storage[slot.storage.0 as usize]
                    .as_ref()
                    .expect("validated above")
                    .cu();
                let slice = self.buffers[slot.buffer.0 as usize]
                    .as_ref()
                    .expect("validated above");
                let (dev_ptr, _record) = slice.device_ptr(&self.stream);

                // We construct the params struct field-by-field using
                // MaybeUninit to avoid UB from zeroing a non-nullable enum
                // field.
                let mut param = std::mem::MaybeUninit::<CUfileIOParams_t>::uninit();
                let p = param.as_mut_ptr();
                // SAFETY: p points to valid, allocated (but uninitialized)
                // memory. We initialize every field before assume_init().
                unsafe {
                    (*p).mode = CUfileBatchMode_t::CUFILE_BATCH;
                    (*p).opcode = CUfileOpcode::CUFILE_READ;
                    (*p).fh = fh;
                    // The correlation token rides in the cookie and comes
                    // back with the completion event.
                    (*p).cookie = slot.token as usize as *mut std::ffi::c_void;
                    (*p).u.batch = CUfileIOParams__bindgen_ty_1__bindgen_ty_1 {
                        devPtr_base: dev_ptr as *mut std::ffi::c_void,
                        file_offset: slot.file_offset as libc::off_t,
                        devPtr_offset: slot.buffer_offset as libc::off_t,
                        size: slot.len,
                    };
                }
                // SAFETY: All fields have been initialized above.
                unsafe { param.assume_init() }
            })
            .collect();

        // SAFETY: slots.len() <= depth was validated, the params array holds
        // fully initialized descriptors, and every device pointer comes from
        // a live registered allocation.
        unsafe {
            batch_io_submit(handle, &params, 0).map_err(|e| {
                Error::new(ErrorKind::Submit, format!("batch_io_submit failed: {e}"))
                    .with_operation("CufileSubsystem::batch_submit")
            })?;
        }

        Ok(())
    }

    fn batch_poll(
        &mut self,
        batch: BatchId,
        min_nr: usize,
        events: &mut [CompletionEvent],
    ) -> Result<usize> {
        let handle = self
            .batches
            .get(batch.0 as usize)
            .and_then(Option::as_ref)
            .map(|b| b.handle)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown batch handle {}", batch.0))
                    .with_operation("CufileSubsystem::batch_poll")
            })?;

        // No deadline: the call waits until at least min_nr completions are
        // available.
        let ts = timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };

        let mut nr = events.len() as u32;
        let mut raw = vec![unsafe { std::mem::zeroed::<CUfileIOEvents_t>() }; events.len()];

        // SAFETY: handle is valid, the raw event buffer matches nr, and nr
        // is passed by mutable reference to receive the actual count.
        unsafe {
            batch_io_get_status(handle, min_nr as u32, &mut nr, &mut raw, &ts).map_err(|e| {
                Error::new(ErrorKind::Reap, format!("batch_io_get_status failed: {e}"))
                    .with_operation("CufileSubsystem::batch_poll")
            })?;
        }

        let count = (nr as usize).min(events.len());
        for (out, event) in events.iter_mut().zip(&raw[..count]) {
            *out = CompletionEvent {
                token: event.cookie as usize as u64,
                status: map_status(event.status),
                bytes_transferred: event.ret,
            };
        }
        Ok(count)
    }

    fn batch_destroy(&mut self, batch: BatchId) -> Result<()> {
        let tracked = self
            .batches
            .get_mut(batch.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                Error::new(ErrorKind::Unexpected, format!("unknown batch handle {}", batch.0))
                    .with_operation("CufileSubsystem::batch_destroy")
            })?;

        // SAFETY: the handle came from batch_io_setup and is destroyed
        // exactly once; the Option was just drained.
        unsafe {
            batch_io_destroy(tracked.handle).map_err(|e| {
                Error::new(ErrorKind::CuFileError, format!("batch_io_destroy failed: {e}"))
                    .with_operation("CufileSubsystem::batch_destroy")
            })
        }
    }
}

impl Drop for CufileSubsystem {
    fn drop(&mut self) {
        // Best-effort teardown of anything the caller leaked; the driver
        // closes when the Cufile Arc drops.
        for tracked in self.batches.iter_mut().filter_map(Option::take) {
            // SAFETY: each handle is destroyed at most once.
            let _ = unsafe { batch_io_destroy(tracked.handle) };
        }
        for slice in self.buffers.iter_mut().filter_map(Option::take) {
            let _ = self.driver.buf_deregister(&slice);
        }
    }
}

// SAFETY: cuFile batch handles are thread-safe, and every other field is
// already Send.
unsafe impl Send for CufileSubsystem {}

fn map_status(status: CUfileStatus_t) -> CompletionStatus {
    match status {
        CUfileStatus_t::CUFILE_COMPLETE => CompletionStatus::Complete,
        CUfileStatus_t::CUFILE_WAITING => CompletionStatus::Waiting,
        CUfileStatus_t::CUFILE_PENDING => CompletionStatus::Pending,
        CUfileStatus_t::CUFILE_CANCELED => CompletionStatus::Canceled,
        CUfileStatus_t::CUFILE_TIMEOUT => CompletionStatus::Timeout,
        CUfileStatus_t::CUFILE_FAILED => CompletionStatus::Failed,
        CUfileStatus_t::CUFILE_INVALID => CompletionStatus::Invalid,
        #[allow(unreachable_patterns)]
        _ => CompletionStatus::Invalid,
    }
}
