//! Fan-out of the latest sample to viewer sessions
//!
//! Each session owns a single-slot `watch` channel. Publishing overwrites
//! the slot, so a viewer that falls behind simply skips to the newest
//! sample; the publisher never waits on a viewer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::watch;
use tracing::{debug, trace};

use crate::sample::Sample;

type Slot = watch::Sender<Option<Arc<Sample>>>;

#[derive(Debug, Default)]
struct Sessions {
    next_id: u64,
    latest: Option<Arc<Sample>>,
    slots: HashMap<u64, Slot>,
}

#[derive(Debug, Default)]
struct Shared {
    sessions: Mutex<Sessions>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) -> bool {
        let removed = self.lock().slots.remove(&id).is_some();
        if removed {
            debug!(session = id, "Viewer session closed");
        }
        removed
    }
}

/// Holder of the latest sample and the set of live viewer sessions.
#[derive(Debug, Clone, Default)]
pub struct Distributor {
    shared: Arc<Shared>,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a viewer. The latest sample, if any, is ready immediately.
    pub fn subscribe(&self) -> ViewerSession {
        let mut sessions = self.shared.lock();
        let id = sessions.next_id;
        sessions.next_id += 1;

        let (tx, mut rx) = watch::channel(sessions.latest.clone());
        if sessions.latest.is_some() {
            rx.mark_changed();
        }
        sessions.slots.insert(id, tx);
        debug!(session = id, viewers = sessions.slots.len(), "Viewer session opened");

        ViewerSession {
            id,
            rx,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Store `sample` as the latest and push it to every open session.
    ///
    /// Sessions whose receiver is gone are pruned.
    pub fn publish(&self, sample: Sample) {
        let sample = Arc::new(sample);
        let mut sessions = self.shared.lock();
        sessions.latest = Some(sample.clone());

        let before = sessions.slots.len();
        sessions
            .slots
            .retain(|_, slot| slot.send(Some(sample.clone())).is_ok());
        let pruned = before - sessions.slots.len();

        trace!(
            update_count = sample.update_count,
            viewers = sessions.slots.len(),
            pruned,
            "Published sample"
        );
    }

    /// Remove a session by id. Idempotent.
    pub fn unsubscribe(&self, id: u64) -> bool {
        self.shared.remove(id)
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.shared.lock().latest.clone()
    }

    pub fn session_count(&self) -> usize {
        self.shared.lock().slots.len()
    }
}

/// One viewer's subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ViewerSession {
    id: u64,
    rx: watch::Receiver<Option<Arc<Sample>>>,
    shared: Weak<Shared>,
}

impl ViewerSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for a sample newer than the last one returned.
    ///
    /// Returns `None` once the session is closed or the distributor is gone.
    pub async fn next(&mut self) -> Option<Arc<Sample>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(sample) = self.rx.borrow_and_update().clone() {
                return Some(sample);
            }
        }
    }

    /// Newest sample without waiting, if one has been published.
    pub fn current(&self) -> Option<Arc<Sample>> {
        self.rx.borrow().clone()
    }

    /// Whether a sample arrived since the last `next`.
    pub fn has_update(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Close the session. Idempotent.
    pub fn unsubscribe(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
