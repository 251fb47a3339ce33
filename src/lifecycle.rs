//! End-to-end sequencing of one batch read.
//!
//! The forward path is strict: register storage handles, register buffers,
//! build the batch, set up the subsystem tracking, submit, drain. Any
//! failure aborts the forward path immediately and transfers control to
//! teardown, which proceeds from the highest stage actually reached down to
//! the lowest: destroy the batch handle (only if setup succeeded), then
//! deregister buffers, then release storage handles. Teardown steps that
//! fail are logged and never abort the remaining unwind.
//!
//! After a successful drain the coordinator checks conservation: every
//! correlation token must have been observed exactly once. Anything else is
//! subsystem corruption and is asserted, not handled.

use std::path::Path;

use tracing::{debug, info, warn};

use crate::batch::Batch;
use crate::engine::{BatchEngine, DrainSummary};
use crate::error::Result;
use crate::registry::ResourceRegistry;
use crate::subsystem::TransferSubsystem;

/// Outcome of a completed batch read.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    /// Completions confirmed; equals the batch size.
    pub entries_reaped: usize,
    /// Poll calls the reap loop needed.
    pub polls: usize,
    /// Slots that completed successfully.
    pub completed: usize,
    /// Slots that terminated in a non-success state.
    pub failed: usize,
}

/// Run one full batch read: `depth` slots of `slot_size` bytes each, reaped
/// through an event buffer of `window` entries.
///
/// Every slot reads a disjoint `slot_size` region of `path`, in slot order
/// from offset 0. All resources registered for the batch are released before
/// this returns, on both the success and the failure path.
pub fn run_batch_read<S>(
    subsystem: &mut S,
    path: &Path,
    depth: usize,
    slot_size: usize,
    window: usize,
) -> Result<RunReport>
where
    S: TransferSubsystem + ?Sized,
{
    debug!(depth, slot_size, window, path = %path.display(), "starting batch read");

    // Registration unwinds itself on partial failure, so an error here
    // leaves nothing acquired.
    let mut registry = ResourceRegistry::acquire(subsystem, path, depth, slot_size)?;

    let result = drive_batch(subsystem, &registry, slot_size, window);

    // Resources are deregistered only after the batch reached a terminal
    // state (drive_batch does not return earlier).
    registry.release(subsystem);

    let report = result?;
    info!(
        entries_reaped = report.entries_reaped,
        polls = report.polls,
        failed = report.failed,
        "batch read complete"
    );
    Ok(report)
}

/// Build, submit, and drain the batch, then destroy the batch handle.
///
/// The batch handle is destroyed on every exit path, but only ever once,
/// and only because `BatchEngine::setup` succeeded.
fn drive_batch<S>(
    subsystem: &mut S,
    registry: &ResourceRegistry,
    slot_size: usize,
    window: usize,
) -> Result<RunReport>
where
    S: TransferSubsystem + ?Sized,
{
    let batch = Batch::reads(&registry.pairs(), slot_size, subsystem.max_batch_entries())?;

    let mut engine = BatchEngine::setup(subsystem, batch.len())?;

    let outcome = submit_and_drain(subsystem, &mut engine, &batch, window);

    if let Err(e) = engine.destroy(subsystem) {
        warn!(error = %e, "batch handle destroy failed during teardown");
    }

    let summary = outcome?;
    check_conservation(&batch, &summary);

    Ok(RunReport {
        entries_reaped: summary.entries_reaped,
        polls: summary.polls,
        completed: summary.completed(),
        failed: summary.failed(),
    })
}

fn submit_and_drain<S>(
    subsystem: &mut S,
    engine: &mut BatchEngine,
    batch: &Batch,
    window: usize,
) -> Result<DrainSummary>
where
    S: TransferSubsystem + ?Sized,
{
    engine.submit(subsystem, batch)?;
    engine.drain(subsystem, window)
}

/// Assert that each correlation token was observed exactly once.
fn check_conservation(batch: &Batch, summary: &DrainSummary) {
    let mut seen = vec![false; batch.len()];
    for event in &summary.events {
        let token = usize::try_from(event.token).expect("correlation token out of range");
        assert!(
            token < batch.len(),
            "correlation token {token} outside a batch of {}",
            batch.len()
        );
        assert!(!seen[token], "correlation token {token} reported twice");
        seen[token] = true;
    }
    assert!(
        seen.iter().all(|s| *s),
        "not every correlation token was observed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use crate::batch::BatchSlot;
    use crate::error::{Error, ErrorKind};
    use crate::subsystem::{BatchId, BufferId, CompletionEvent, CompletionStatus, StorageId};

    /// Full-protocol double that records every call and can be scripted to
    /// fail at each stage.
    #[derive(Default)]
    struct RecordingSubsystem {
        log: Vec<String>,
        next_storage: u32,
        next_buffer: u32,
        chunk: usize,
        fail_buffer_at: Option<u32>,
        fail_setup: bool,
        fail_submit: bool,
        fail_poll_at: Option<usize>,
        pending: VecDeque<CompletionEvent>,
        polls: usize,
    }

    impl RecordingSubsystem {
        fn new(chunk: usize) -> Self {
            Self {
                chunk,
                ..Default::default()
            }
        }
    }

    impl TransferSubsystem for RecordingSubsystem {
        fn register_storage(&mut self, _path: &Path) -> Result<StorageId> {
            let id = StorageId(self.next_storage);
            self.next_storage += 1;
            self.log.push(format!("register_storage {}", id.0));
            Ok(id)
        }

        fn release_storage(&mut self, id: StorageId) -> Result<()> {
            self.log.push(format!("release_storage {}", id.0));
            Ok(())
        }

        fn register_buffer(&mut self, _len: usize) -> Result<BufferId> {
            if self.fail_buffer_at == Some(self.next_buffer) {
                return Err(Error::new(ErrorKind::Resource, "buffer rejected"));
            }
            let id = BufferId(self.next_buffer);
            self.next_buffer += 1;
            self.log.push(format!("register_buffer {}", id.0));
            Ok(id)
        }

        fn release_buffer(&mut self, id: BufferId) -> Result<()> {
            self.log.push(format!("release_buffer {}", id.0));
            Ok(())
        }

        fn batch_setup(&mut self, depth: usize) -> Result<BatchId> {
            if self.fail_setup {
                return Err(Error::new(ErrorKind::Setup, "tracking allocation failed"));
            }
            self.log.push(format!("batch_setup {depth}"));
            Ok(BatchId(0))
        }

        fn batch_submit(&mut self, _batch: BatchId, slots: &[BatchSlot]) -> Result<()> {
            if self.fail_submit {
                return Err(Error::new(ErrorKind::Submit, "batch rejected"));
            }
            self.log.push(format!("batch_submit {}", slots.len()));
            for slot in slots {
                self.pending.push_back(CompletionEvent {
                    token: slot.token,
                    status: CompletionStatus::Complete,
                    bytes_transferred: slot.len,
                });
            }
            Ok(())
        }

        fn batch_poll(
            &mut self,
            _batch: BatchId,
            _min_nr: usize,
            events: &mut [CompletionEvent],
        ) -> Result<usize> {
            self.polls += 1;
            if self.fail_poll_at == Some(self.polls) {
                return Err(Error::new(ErrorKind::Reap, "poll fault"));
            }
            self.log.push("batch_poll".to_string());
            let count = self.chunk.min(events.len()).min(self.pending.len());
            for slot in events.iter_mut().take(count) {
                *slot = self.pending.pop_front().unwrap();
            }
            Ok(count)
        }

        fn batch_destroy(&mut self, _batch: BatchId) -> Result<()> {
            self.log.push("batch_destroy".to_string());
            Ok(())
        }
    }

    fn path() -> &'static Path {
        Path::new("/data/f.bin")
    }

    #[test]
    fn test_success_path_ordering() {
        let mut sub = RecordingSubsystem::new(2);
        let report = run_batch_read(&mut sub, path(), 4, 4096, 2).unwrap();

        assert_eq!(report.entries_reaped, 4);
        assert_eq!(report.polls, 2);
        assert_eq!(report.completed, 4);
        assert_eq!(report.failed, 0);

        assert_eq!(
            sub.log,
            vec![
                "register_storage 0",
                "register_storage 1",
                "register_storage 2",
                "register_storage 3",
                "register_buffer 0",
                "register_buffer 1",
                "register_buffer 2",
                "register_buffer 3",
                "batch_setup 4",
                "batch_submit 4",
                "batch_poll",
                "batch_poll",
                "batch_destroy",
                "release_buffer 3",
                "release_buffer 2",
                "release_buffer 1",
                "release_buffer 0",
                "release_storage 3",
                "release_storage 2",
                "release_storage 1",
                "release_storage 0",
            ]
        );
    }

    #[test]
    fn test_teardown_happens_only_after_terminal_state() {
        // Deregistration must come after the last poll and after destroy.
        let mut sub = RecordingSubsystem::new(16);
        run_batch_read(&mut sub, path(), 8, 4096, 16).unwrap();

        let destroy_at = sub.log.iter().position(|l| l == "batch_destroy").unwrap();
        let last_poll = sub
            .log
            .iter()
            .rposition(|l| l == "batch_poll")
            .unwrap();
        let first_release = sub
            .log
            .iter()
            .position(|l| l.starts_with("release_"))
            .unwrap();

        assert!(last_poll < destroy_at);
        assert!(destroy_at < first_release);
    }

    #[test]
    fn test_registration_failure_releases_nothing_twice() {
        let mut sub = RecordingSubsystem {
            fail_buffer_at: Some(2),
            chunk: 16,
            ..Default::default()
        };
        let err = run_batch_read(&mut sub, path(), 4, 4096, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        // No batch stage was ever reached.
        assert!(!sub.log.iter().any(|l| l.starts_with("batch_")));
        // Buffers 1, 0 then storage 3..0 released exactly once, in reverse.
        let releases: Vec<_> = sub
            .log
            .iter()
            .filter(|l| l.starts_with("release_"))
            .cloned()
            .collect();
        assert_eq!(
            releases,
            vec![
                "release_buffer 1",
                "release_buffer 0",
                "release_storage 3",
                "release_storage 2",
                "release_storage 1",
                "release_storage 0",
            ]
        );
    }

    #[test]
    fn test_setup_failure_skips_submit_and_destroy() {
        let mut sub = RecordingSubsystem {
            fail_setup: true,
            chunk: 16,
            ..Default::default()
        };
        let err = run_batch_read(&mut sub, path(), 4, 4096, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);

        // destroy is only valid for a handle returned by a successful setup.
        assert!(!sub.log.iter().any(|l| l == "batch_destroy"));
        assert!(!sub.log.iter().any(|l| l.starts_with("batch_submit")));
        // All resources still released.
        assert_eq!(
            sub.log.iter().filter(|l| l.starts_with("release_")).count(),
            8
        );
    }

    #[test]
    fn test_submit_failure_skips_poll_but_destroys_and_releases() {
        let mut sub = RecordingSubsystem {
            fail_submit: true,
            chunk: 16,
            ..Default::default()
        };
        let err = run_batch_read(&mut sub, path(), 4, 4096, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Submit);

        assert!(!sub.log.iter().any(|l| l == "batch_poll"));
        assert_eq!(
            sub.log.iter().filter(|l| *l == "batch_destroy").count(),
            1
        );
        assert_eq!(
            sub.log.iter().filter(|l| l.starts_with("release_")).count(),
            8
        );
    }

    #[test]
    fn test_reap_failure_still_tears_down_everything() {
        let mut sub = RecordingSubsystem {
            chunk: 4,
            fail_poll_at: Some(2),
            ..Default::default()
        };
        let err = run_batch_read(&mut sub, path(), 16, 4096, 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Reap);

        let ctx: Vec<_> = err.context_iter().collect();
        assert!(ctx.contains(&("entries_reaped", "4")));

        assert_eq!(
            sub.log.iter().filter(|l| *l == "batch_destroy").count(),
            1
        );
        assert_eq!(
            sub.log.iter().filter(|l| l.starts_with("release_")).count(),
            32
        );
    }

    #[test]
    fn test_scenario_geometry() {
        // The reference scenario: 128 slots of 4096 bytes, window 16.
        let mut sub = RecordingSubsystem::new(16);
        let report = run_batch_read(&mut sub, path(), 128, 4096, 16).unwrap();
        assert_eq!(report.entries_reaped, 128);
        assert_eq!(report.polls, 8);
        assert_eq!(report.completed, 128);
    }
}
