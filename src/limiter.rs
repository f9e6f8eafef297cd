//! Per-key serialization and global concurrency limiting.
//!
//! The pipeline must process the turns of one conversation strictly in
//! arrival order (the handler's state depends on sequential history) while
//! letting unrelated conversations run in parallel. The [`KeySerializer`]
//! enforces both:
//!
//! - at most one in-flight task per [`ConversationKey`], FIFO among waiters
//!   of the same key
//! - a global in-flight cap across all keys
//!
//! Admission is two-phase. [`begin`](KeySerializer::begin) registers the
//! caller in the key's turn queue *synchronously*, so queue position is
//! fixed at call time regardless of how the executor later schedules the
//! waiting tasks; [`PendingAdmission::admitted`] then waits for the turn and
//! a slot of the global cap. [`admit`](KeySerializer::admit) combines both
//! for callers that do not need the ordering split.
//!
//! The returned [`Ticket`] releases the key turn and the global permit on
//! drop, so release is guaranteed on success, handler error, panic
//! unwinding, and task cancellation alike. A `PendingAdmission` dropped
//! before its turn (a cancelled waiter) yields its queue position the same
//! way, so an abandoned registration can never wedge its key.
//!
//! The key table is the only cross-task mutable shared state in the core.
//! Entries are created lazily on first registration and removed when the
//! last waiter or ticket for that key is gone, so idle keys do not
//! accumulate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::message::ConversationKey;

/// Admission control for delivery-processing tasks.
///
/// Cheap to clone; clones share the same key table and global cap.
#[derive(Clone)]
pub struct KeySerializer {
    shared: Arc<Shared>,
}

struct Shared {
    keys: StdMutex<HashMap<ConversationKey, KeyEntry>>,
    global: Arc<Semaphore>,
}

/// Turn queue for one key: `turn` broadcasts the sequence number currently
/// allowed to run; `next` is handed to the next registrant; `skipped` holds
/// turns abandoned before they came up.
struct KeyEntry {
    turn: watch::Sender<u64>,
    next: u64,
    skipped: HashSet<u64>,
    refs: usize,
}

impl KeySerializer {
    /// Create a serializer with the given global in-flight cap.
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                keys: StdMutex::new(HashMap::new()),
                global: Arc::new(Semaphore::new(max_in_flight)),
            }),
        }
    }

    /// Register for admission on `key`.
    ///
    /// Registration is synchronous: two `begin` calls for the same key are
    /// admitted in call order, which is how the pipeline pins per-key
    /// processing order to queue arrival order.
    pub fn begin(&self, key: ConversationKey) -> PendingAdmission {
        let (seq, rx) = {
            let mut keys = self.shared.keys.lock().expect("key table poisoned");
            let entry = keys.entry(key.clone()).or_insert_with(|| {
                let (turn, _) = watch::channel(0);
                KeyEntry {
                    turn,
                    next: 0,
                    skipped: HashSet::new(),
                    refs: 0,
                }
            });
            entry.refs += 1;
            let seq = entry.next;
            entry.next += 1;
            (seq, entry.turn.subscribe())
        };

        PendingAdmission {
            key_ref: KeyRef {
                shared: Arc::clone(&self.shared),
                key: key.clone(),
            },
            turn: TurnGuard {
                shared: Arc::clone(&self.shared),
                key,
                seq,
            },
            rx,
            global: Arc::clone(&self.shared.global),
        }
    }

    /// Admit a task for `key`: [`begin`](Self::begin) plus the wait.
    ///
    /// Blocks until no other task holds the key's turn and the global
    /// in-flight count is below the cap. Returns `Err` only if the
    /// serializer has been [`close`](Self::close)d (shutdown); pending
    /// admissions unblock with that error.
    pub async fn admit(&self, key: ConversationKey) -> Result<Ticket, AdmitError> {
        self.begin(key).admitted().await
    }

    /// Close the serializer: pending and future admissions fail.
    ///
    /// Tickets already issued stay valid until dropped.
    pub fn close(&self) {
        self.shared.global.close();
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.shared.keys.lock().expect("key table poisoned").len()
    }
}

impl Shared {
    /// Give up turn `seq` on `key`, advancing the turn counter past any
    /// already-abandoned successors.
    fn release_turn(&self, key: &ConversationKey, seq: u64) {
        let mut keys = self.keys.lock().expect("key table poisoned");
        let Some(entry) = keys.get_mut(key) else { return };

        if *entry.turn.borrow() == seq {
            let mut next = seq + 1;
            while entry.skipped.remove(&next) {
                next += 1;
            }
            let _ = entry.turn.send(next);
        } else {
            entry.skipped.insert(seq);
        }
    }
}

/// A registered-but-not-yet-admitted task.
///
/// Dropping it (e.g. on cancellation) yields its queue position without
/// blocking later waiters on the same key.
pub struct PendingAdmission {
    // Field order matters: the turn must be released while the key entry is
    // still referenced.
    turn: TurnGuard,
    key_ref: KeyRef,
    rx: watch::Receiver<u64>,
    global: Arc<Semaphore>,
}

impl PendingAdmission {
    /// Wait for this registration's turn and a free slot of the global cap.
    ///
    /// The turn is awaited before the global permit so that a waiter on the
    /// cap can never be overtaken by a later arrival for the same key.
    pub async fn admitted(mut self) -> Result<Ticket, AdmitError> {
        let seq = self.turn.seq;
        self.rx
            .wait_for(|turn| *turn == seq)
            .await
            .map_err(|_| AdmitError::closed())?;

        let permit = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| AdmitError::closed())?;

        Ok(Ticket {
            _permit: permit,
            _turn: self.turn,
            _key_ref: self.key_ref,
        })
    }
}

/// Scoped admission token for one delivery-processing task.
///
/// Holding a `Ticket` means exclusive processing rights for its conversation
/// key plus one slot of the global cap. Both are released when the ticket is
/// dropped.
pub struct Ticket {
    _permit: OwnedSemaphorePermit,
    _turn: TurnGuard,
    _key_ref: KeyRef,
}

/// Ownership of one turn in a key's queue; releases it on drop.
struct TurnGuard {
    shared: Arc<Shared>,
    key: ConversationKey,
    seq: u64,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.shared.release_turn(&self.key, self.seq);
    }
}

/// Reference-counted handle on a key-table entry, so the entry is removed
/// once the last waiter or ticket for the key is gone.
struct KeyRef {
    shared: Arc<Shared>,
    key: ConversationKey,
}

impl Drop for KeyRef {
    fn drop(&mut self) {
        let mut keys = self.shared.keys.lock().expect("key table poisoned");
        if let Some(entry) = keys.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                keys.remove(&self.key);
            }
        }
    }
}

/// Error returned by admission after shutdown.
#[derive(Debug)]
pub struct AdmitError(());

impl AdmitError {
    fn closed() -> Self {
        Self(())
    }
}

impl std::fmt::Display for AdmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Admission refused, serializer is shut down")
    }
}

impl std::error::Error for AdmitError {}
