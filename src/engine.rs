//! Batch execution: submission, completion reaping, and batch teardown.
//!
//! [`BatchEngine`] owns the state machine of one batch:
//!
//! ```text
//! Built -> Submitted -> Reaping -> Complete
//!   \________\___________\______-> Failed
//! ```
//!
//! `Complete` and `Failed` are terminal; `Failed` is reachable from any
//! non-terminal state. The engine holds the subsystem's batch handle and
//! guarantees it is destroyed at most once, in either terminal state.
//!
//! # The reap loop
//!
//! The caller owns a fixed-capacity event buffer (the reap window). Each
//! [`drain`](BatchEngine::drain) poll asks the subsystem for completions
//! with `min_nr = 0`, so a call never blocks waiting for more completions
//! than are actually outstanding, and may legitimately return zero. The loop
//! accumulates the per-poll counts until every submitted slot is accounted
//! for. Correctness rests only on the subsystem never losing or duplicating
//! a completion; the window can therefore be far smaller than the batch.

use crate::batch::Batch;
use crate::error::{Error, ErrorKind, Result};
use crate::subsystem::{BatchId, CompletionEvent, CompletionStatus, TransferSubsystem};

/// State of one batch as it moves through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// Descriptors assembled, nothing handed to the subsystem yet.
    Built,
    /// The whole batch was accepted by the subsystem.
    Submitted,
    /// The reap loop is collecting completions.
    Reaping,
    /// Every submitted slot was accounted for. Terminal.
    Complete,
    /// A subsystem fault aborted the batch. Terminal.
    Failed,
}

impl BatchState {
    /// Whether the batch has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Complete | BatchState::Failed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchState::Built => "built",
            BatchState::Submitted => "submitted",
            BatchState::Reaping => "reaping",
            BatchState::Complete => "complete",
            BatchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Ephemeral bookkeeping threaded through one reap loop.
#[derive(Debug, Clone, Copy)]
struct ReapCursor {
    /// Monotonic count of completions confirmed so far.
    entries_reaped: usize,
    /// Number of poll calls issued.
    polls: usize,
}

/// Result of a fully drained batch.
#[derive(Debug)]
pub struct DrainSummary {
    /// Total completions confirmed; equals the number of submitted slots.
    pub entries_reaped: usize,
    /// Number of poll calls the loop needed.
    pub polls: usize,
    /// Every completion event, in the order the subsystem reported them.
    pub events: Vec<CompletionEvent>,
}

impl DrainSummary {
    /// Number of events that completed successfully.
    pub fn completed(&self) -> usize {
        self.events
            .iter()
            .filter(|e| e.status == CompletionStatus::Complete)
            .count()
    }

    /// Number of events that terminated in a non-success state.
    pub fn failed(&self) -> usize {
        self.events.len() - self.completed()
    }
}

/// Drives one batch from submission through completion reaping.
///
/// Constructed by [`setup`](BatchEngine::setup), which reserves subsystem
/// tracking resources; an engine therefore always corresponds to a
/// successfully created subsystem batch handle.
#[derive(Debug)]
pub struct BatchEngine {
    batch_id: Option<BatchId>,
    depth: usize,
    submitted: usize,
    state: BatchState,
}

impl BatchEngine {
    /// Reserve subsystem resources sized for `depth` concurrent operations.
    ///
    /// # Errors
    ///
    /// `ConfigInvalid` if `depth` is zero or exceeds the subsystem limit;
    /// `Setup` (propagated) if the subsystem cannot allocate tracking state.
    /// After a setup error the caller must not submit.
    pub fn setup<S>(subsystem: &mut S, depth: usize) -> Result<Self>
    where
        S: TransferSubsystem + ?Sized,
    {
        let limit = subsystem.max_batch_entries();
        if depth == 0 || depth > limit {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!("batch depth must be in 1..={limit}, got {depth}"),
            )
            .with_operation("BatchEngine::setup"));
        }

        let batch_id = subsystem
            .batch_setup(depth)
            .map_err(|e| e.with_operation("BatchEngine::setup"))?;

        Ok(Self {
            batch_id: Some(batch_id),
            depth,
            submitted: 0,
            state: BatchState::Built,
        })
    }

    /// Current state of the batch.
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Number of operations the subsystem tracking was sized for.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Hand the entire batch to the subsystem, atomically.
    ///
    /// Transitions `Built -> Submitted`. On error the engine moves to
    /// `Failed`: a failed submit carries no guarantee about which slots were
    /// internally accepted, so the batch is not runnable and the caller must
    /// go directly to teardown.
    pub fn submit<S>(&mut self, subsystem: &mut S, batch: &Batch) -> Result<()>
    where
        S: TransferSubsystem + ?Sized,
    {
        if self.state != BatchState::Built {
            return Err(Error::new(
                ErrorKind::Unexpected,
                format!("submit on a batch in state {}", self.state),
            )
            .with_operation("BatchEngine::submit"));
        }
        if batch.len() > self.depth {
            return Err(Error::new(
                ErrorKind::ConfigInvalid,
                format!(
                    "batch of {} slots exceeds the reserved depth of {}",
                    batch.len(),
                    self.depth
                ),
            )
            .with_operation("BatchEngine::submit"));
        }

        let id = self.id()?;
        match subsystem.batch_submit(id, batch.slots()) {
            Ok(()) => {
                self.submitted = batch.len();
                self.state = BatchState::Submitted;
                Ok(())
            }
            Err(e) => {
                self.state = BatchState::Failed;
                Err(e.with_operation("BatchEngine::submit"))
            }
        }
    }

    /// Reap until every submitted slot is accounted for.
    ///
    /// `window` is the fixed capacity of the event buffer; the subsystem may
    /// fill any prefix of it per poll, including none. Zero-progress polls do
    /// not terminate the loop.
    ///
    /// On a subsystem fault the loop stops immediately, the engine moves to
    /// `Failed`, and the returned error records how many entries had already
    /// been confirmed (diagnostic only; a partially reaped batch is not
    /// resumable).
    ///
    /// # Panics
    ///
    /// If the subsystem reports more completions than fit the window, or
    /// more total completions than were submitted. Both are protocol
    /// violations that indicate subsystem corruption, not recoverable
    /// conditions.
    pub fn drain<S>(&mut self, subsystem: &mut S, window: usize) -> Result<DrainSummary>
    where
        S: TransferSubsystem + ?Sized,
    {
        if window == 0 {
            return Err(
                Error::new(ErrorKind::ConfigInvalid, "reap window must be non-zero")
                    .with_operation("BatchEngine::drain"),
            );
        }
        if self.state != BatchState::Submitted {
            return Err(Error::new(
                ErrorKind::Unexpected,
                format!("drain on a batch in state {}", self.state),
            )
            .with_operation("BatchEngine::drain"));
        }

        self.state = BatchState::Reaping;
        let id = self.id()?;

        let mut events = vec![CompletionEvent::default(); window];
        let mut collected = Vec::with_capacity(self.submitted);
        let mut cursor = ReapCursor {
            entries_reaped: 0,
            polls: 0,
        };

        while cursor.entries_reaped < self.submitted {
            // min_nr = 0 on every call: the loop never blocks waiting for
            // more completions than remain outstanding.
            let count = match subsystem.batch_poll(id, 0, &mut events) {
                Ok(count) => count,
                Err(e) => {
                    self.state = BatchState::Failed;
                    return Err(e
                        .with_operation("BatchEngine::drain")
                        .with_context("entries_reaped", cursor.entries_reaped.to_string()));
                }
            };
            cursor.polls += 1;

            assert!(
                count <= window,
                "subsystem wrote {count} completions into an event buffer of {window}"
            );
            cursor.entries_reaped += count;
            assert!(
                cursor.entries_reaped <= self.submitted,
                "subsystem reported {} completions for a batch of {}",
                cursor.entries_reaped,
                self.submitted
            );

            collected.extend_from_slice(&events[..count]);
            tracing::trace!(
                count,
                entries_reaped = cursor.entries_reaped,
                polls = cursor.polls,
                "reaped completions"
            );
        }

        self.state = BatchState::Complete;
        Ok(DrainSummary {
            entries_reaped: cursor.entries_reaped,
            polls: cursor.polls,
            events: collected,
        })
    }

    /// Release the subsystem-side batch tracking.
    ///
    /// Runs at most once; later calls are no-ops. Valid in both terminal
    /// states, and on the abandonment path before submission.
    pub fn destroy<S>(&mut self, subsystem: &mut S) -> Result<()>
    where
        S: TransferSubsystem + ?Sized,
    {
        match self.batch_id.take() {
            Some(id) => subsystem
                .batch_destroy(id)
                .map_err(|e| e.with_operation("BatchEngine::destroy")),
            None => Ok(()),
        }
    }

    /// Whether the subsystem handle is still held (destroy not yet called).
    pub fn holds_handle(&self) -> bool {
        self.batch_id.is_some()
    }

    fn id(&self) -> Result<BatchId> {
        self.batch_id.ok_or_else(|| {
            Error::new(ErrorKind::Unexpected, "batch handle used after destroy")
        })
    }
}
