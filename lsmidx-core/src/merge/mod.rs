//! Merge engine: moves a sealed top into a new base structure
//!
//! A merge is a move, not a copy: every entry of the sealed top and the
//! old base appears exactly once in the merged segment, and nothing else
//! does. The phases run Idle -> Triggered -> Merging -> Swapping -> Idle;
//! a failure anywhere before the dictionary swap leaves the old base and
//! sealed top authoritative.

use crate::{IndexEntry, LsmError, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::iter::Peekable;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Merge policy knobs
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Trigger a merge after this many inserts into the current top
    pub insert_threshold: u64,
    /// Trigger a merge once the top exceeds this many bytes
    pub top_size_limit: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            insert_threshold: crate::config::MERGE_INSERT_THRESHOLD,
            top_size_limit: crate::config::TOP_SIZE_LIMIT,
        }
    }
}

/// Phase of the merge state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MergePhase {
    /// No merge pending
    Idle = 0,
    /// A threshold fired; the worker has been signalled
    Triggered = 1,
    /// Streaming the sealed top and old base into a new segment
    Merging = 2,
    /// Persisting the dictionary swap
    Swapping = 3,
}

/// Lock-free holder for the current merge phase
pub struct MergeState(AtomicU8);

impl MergeState {
    /// Start in `Idle`
    pub fn new() -> Self {
        Self(AtomicU8::new(MergePhase::Idle as u8))
    }

    /// Current phase
    pub fn phase(&self) -> MergePhase {
        match self.0.load(Ordering::Acquire) {
            0 => MergePhase::Idle,
            1 => MergePhase::Triggered,
            2 => MergePhase::Merging,
            _ => MergePhase::Swapping,
        }
    }

    /// Unconditional transition
    pub fn set(&self, phase: MergePhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    /// Transition only from an expected phase; returns whether it won
    pub fn transition(&self, from: MergePhase, to: MergePhase) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for MergeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Message to the merge worker
enum MergeMessage {
    Trigger,
    Shutdown,
}

/// Dedicated background thread running merges
///
/// The channel is bounded at one slot so repeated triggers coalesce while
/// a merge is running; the insert path never blocks on it.
pub struct MergeWorker {
    sender: Sender<MergeMessage>,
    handle: Option<JoinHandle<()>>,
}

impl MergeWorker {
    /// Spawn the worker; `merge_fn` runs once per trigger
    pub fn spawn<F>(name: &str, merge_fn: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (sender, receiver): (Sender<MergeMessage>, Receiver<MergeMessage>) = bounded(1);

        let handle = thread::Builder::new()
            .name(format!("lsmidx-merge-{}", name))
            .spawn(move || {
                debug!("Merge worker started");
                for msg in receiver.iter() {
                    match msg {
                        MergeMessage::Trigger => merge_fn(),
                        MergeMessage::Shutdown => break,
                    }
                }
                debug!("Merge worker stopped");
            })
            .map_err(|e| LsmError::Merge(format!("Failed to spawn worker: {}", e)))?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Signal the worker without blocking; a full queue means a trigger
    /// is already pending
    pub fn trigger(&self) {
        let _ = self.sender.try_send(MergeMessage::Trigger);
    }

    /// Stop the worker and wait for it to finish
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(MergeMessage::Shutdown);
            if handle.join().is_err() {
                warn!("Merge worker panicked during shutdown");
            } else {
                info!("Merge worker shut down");
            }
        }
    }
}

impl Drop for MergeWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ordered union of a sealed top and the old base
///
/// Both inputs arrive sorted by (key, row). An exact (key, row) pair
/// present in both collapses to the top's copy, so replayed inserts of an
/// already-based entry cannot duplicate it.
pub struct MergeIterator<A, B>
where
    A: Iterator<Item = Result<IndexEntry>>,
    B: Iterator<Item = Result<IndexEntry>>,
{
    top: Peekable<A>,
    base: Peekable<B>,
}

impl<A, B> MergeIterator<A, B>
where
    A: Iterator<Item = Result<IndexEntry>>,
    B: Iterator<Item = Result<IndexEntry>>,
{
    /// Merge `top` (sealed top) over `base` (old base)
    pub fn new(top: A, base: B) -> Self {
        Self {
            top: top.peekable(),
            base: base.peekable(),
        }
    }
}

impl<A, B> Iterator for MergeIterator<A, B>
where
    A: Iterator<Item = Result<IndexEntry>>,
    B: Iterator<Item = Result<IndexEntry>>,
{
    type Item = Result<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        // Errors surface immediately and end the merge
        if matches!(self.top.peek(), Some(Err(_))) {
            return self.top.next();
        }
        if matches!(self.base.peek(), Some(Err(_))) {
            return self.base.next();
        }

        match (self.top.peek(), self.base.peek()) {
            (None, None) => None,
            (Some(_), None) => self.top.next(),
            (None, Some(_)) => self.base.next(),
            (Some(Ok(t)), Some(Ok(b))) => {
                let t_ord = (&t.key, &t.row);
                let b_ord = (&b.key, &b.row);
                if t_ord == b_ord {
                    // Same entry in both layers: keep one copy
                    let entry = self.top.next();
                    self.base.next();
                    entry
                } else if t_ord < b_ord {
                    self.top.next()
                } else {
                    self.base.next()
                }
            }
            // Err peeks were drained above
            _ => unreachable!(),
        }
    }
}
