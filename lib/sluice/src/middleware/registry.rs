//! In-flight registry shared by the coalescing middlewares.
//!
//! Each key maps to the waiters of the call currently leading it. Joining and
//! opening happen under the owner's mutex in one critical section, which is
//! what guarantees a single leader per key and cycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{Error, Request, Response, Result};

/// Callback receiving the settled outcome of a coalesced call.
pub(crate) type Waiter = oneshot::Sender<Result<Response<Bytes>>>;

/// Per-call predicate (`skip`, `clear`).
pub type RequestPredicate = Arc<dyn Fn(&Request<Bytes>) -> bool + Send + Sync>;

/// Per-call key function.
pub type KeyFn = Arc<dyn Fn(&Request<Bytes>) -> String + Send + Sync>;

/// Lock a middleware registry, recovering from poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Await a waiter; a dropped leader surfaces as [`Error::Cancelled`].
pub(crate) async fn follow(
    receiver: oneshot::Receiver<Result<Response<Bytes>>>,
) -> Result<Response<Bytes>> {
    receiver.await.unwrap_or_else(|_| Err(Error::Cancelled))
}

/// Hand `result` to every waiter, in registration order.
///
/// Waiters whose caller has gone away are skipped silently.
pub(crate) fn notify(
    waiters: Vec<Waiter>,
    result: &Result<Response<Bytes>>,
    resolve: impl Fn(&Response<Bytes>) -> Response<Bytes>,
) {
    for waiter in waiters {
        let outcome = match result {
            Ok(response) => Ok(resolve(response)),
            Err(err) => Err(err.clone()),
        };
        let _ = waiter.send(outcome);
    }
}

/// Outcome of looking a key up in the registry.
pub(crate) enum Slot {
    /// No call in flight: the caller leads cycle `id`.
    Lead(u64),
    /// A call is in flight: wait for its outcome.
    Follow(oneshot::Receiver<Result<Response<Bytes>>>),
}

#[derive(Debug)]
struct Cycle {
    id: u64,
    waiters: Vec<Waiter>,
}

/// Keys with a live leader, and who is waiting on them.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    next_id: u64,
    current: HashMap<String, Cycle>,
    /// Cycles displaced by a newer leader on the same key, still owned by
    /// their own leader.
    displaced: HashMap<u64, Vec<Waiter>>,
}

impl Inflight {
    /// Number of keys with a live leader.
    pub(crate) fn len(&self) -> usize {
        self.current.len()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.current.contains_key(key)
    }

    /// Queue a waiter behind the current leader of `key`, if there is one.
    pub(crate) fn join(
        &mut self,
        key: &str,
    ) -> Option<oneshot::Receiver<Result<Response<Bytes>>>> {
        let cycle = self.current.get_mut(key)?;
        let (sender, receiver) = oneshot::channel();
        cycle.waiters.push(sender);
        Some(receiver)
    }

    /// Register a new leader for `key` and return its cycle id.
    pub(crate) fn open(&mut self, key: &str) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        let previous = self.current.insert(
            key.to_string(),
            Cycle {
                id,
                waiters: Vec::new(),
            },
        );
        if let Some(previous) = previous {
            self.displaced.insert(previous.id, previous.waiters);
        }
        id
    }

    /// Follow the current leader of `key`, or become it.
    pub(crate) fn join_or_open(&mut self, key: &str) -> Slot {
        match self.join(key) {
            Some(receiver) => Slot::Follow(receiver),
            None => Slot::Lead(self.open(key)),
        }
    }

    /// Remove the cycle `id` of `key` and return its waiters.
    pub(crate) fn settle(&mut self, key: &str, id: u64) -> Vec<Waiter> {
        if self.current.get(key).is_some_and(|cycle| cycle.id == id) {
            return self
                .current
                .remove(key)
                .map(|cycle| cycle.waiters)
                .unwrap_or_default();
        }
        self.displaced.remove(&id).unwrap_or_default()
    }

    /// Remove whichever cycle currently leads `key` and return its waiters.
    pub(crate) fn drain(&mut self, key: &str) -> Vec<Waiter> {
        self.current
            .remove(key)
            .map(|cycle| cycle.waiters)
            .unwrap_or_default()
    }
}

/// State types owning an [`Inflight`] registry.
pub(crate) trait HasInflight {
    fn inflight_mut(&mut self) -> &mut Inflight;
}

/// Leadership of one cycle; removes the registry row even if the leading
/// future is dropped before the call settles.
pub(crate) struct CycleGuard<S: HasInflight> {
    state: Arc<Mutex<S>>,
    key: String,
    id: u64,
    armed: bool,
}

impl<S: HasInflight> CycleGuard<S> {
    pub(crate) fn new(state: Arc<Mutex<S>>, key: String, id: u64) -> Self {
        Self {
            state,
            key,
            id,
            armed: true,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    /// Close the cycle, running `update` on the state in the same critical
    /// section, and return the waiters to notify.
    pub(crate) fn finish(mut self, update: impl FnOnce(&mut S, &str)) -> Vec<Waiter> {
        self.armed = false;
        let mut state = lock(&self.state);
        update(&mut state, &self.key);
        state.inflight_mut().settle(&self.key, self.id)
    }
}

impl<S: HasInflight> Drop for CycleGuard<S> {
    fn drop(&mut self) {
        if self.armed {
            let waiters = lock(&self.state).inflight_mut().settle(&self.key, self.id);
            tracing::debug!(key = %self.key, waiters = waiters.len(), "leading request dropped");
        }
    }
}
