//! Collapses concurrent identical requests into one network call.
//!
//! # Design
//! - The first caller for a fingerprint becomes the leader and runs the
//!   executor; later callers attach a oneshot receiver and wait.
//! - The leader settles every waiter with a clone of its own result, then the
//!   group entry disappears. A request arriving afterwards starts a new group.
//! - Eviction runs from a guard so a leader dropped mid-flight still removes
//!   its group; waiters then observe [`RequestError::Cancelled`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RequestError;
use crate::fingerprint::RequestFingerprint;

type Settled<T> = Result<T, RequestError>;
type Waiters<T> = Vec<oneshot::Sender<Settled<T>>>;
type JoinHook = Arc<dyn Fn(&RequestFingerprint) + Send + Sync>;

/// Fingerprint-keyed table of in-flight request groups.
pub struct DedupQueue<T> {
    groups: Arc<Groups<T>>,
    on_join: Option<JoinHook>,
}

impl<T> Clone for DedupQueue<T> {
    fn clone(&self) -> Self {
        Self {
            groups: Arc::clone(&self.groups),
            on_join: self.on_join.clone(),
        }
    }
}

impl<T> Default for DedupQueue<T> {
    fn default() -> Self {
        Self {
            groups: Arc::new(Mutex::new(HashMap::new())),
            on_join: None,
        }
    }
}

impl<T> fmt::Debug for DedupQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupQueue")
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

enum Role<T> {
    Leader,
    Waiter(oneshot::Receiver<Settled<T>>),
}

impl<T> DedupQueue<T> {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke `hook` every time a caller joins an existing group.
    #[must_use]
    pub fn with_join_hook(
        mut self,
        hook: impl Fn(&RequestFingerprint) + Send + Sync + 'static,
    ) -> Self {
        self.on_join = Some(Arc::new(hook));
        self
    }

    /// Number of groups currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.groups().len()
    }

    /// Whether a group exists for `fingerprint`.
    #[must_use]
    pub fn is_in_flight(&self, fingerprint: &RequestFingerprint) -> bool {
        self.groups().contains_key(fingerprint)
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<RequestFingerprint, Waiters<T>>> {
        lock(&self.groups)
    }

    fn join_or_lead(&self, fingerprint: &RequestFingerprint) -> Role<T> {
        let mut groups = self.groups();
        if let Some(waiters) = groups.get_mut(fingerprint) {
            let (sender, receiver) = oneshot::channel();
            waiters.push(sender);
            Role::Waiter(receiver)
        } else {
            groups.insert(fingerprint.clone(), Vec::new());
            Role::Leader
        }
    }
}

impl<T: Clone> DedupQueue<T> {
    /// Run `executor` unless an identical call is already in flight, in
    /// which case wait for that call's result instead.
    ///
    /// # Errors
    ///
    /// Returns the executor's error, shared by every caller in the group, or
    /// [`RequestError::Cancelled`] when the leader was dropped before settling.
    pub async fn enqueue<F, Fut>(&self, fingerprint: RequestFingerprint, executor: F) -> Settled<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Settled<T>>,
    {
        match self.join_or_lead(&fingerprint) {
            Role::Waiter(receiver) => {
                if let Some(hook) = &self.on_join {
                    hook(&fingerprint);
                }
                debug!(fingerprint = %fingerprint, "joined in-flight request");
                receiver.await.unwrap_or(Err(RequestError::Cancelled))
            }
            Role::Leader => {
                let mut guard = GroupGuard {
                    groups: &self.groups,
                    fingerprint: Some(fingerprint),
                };
                let result = executor().await;
                guard.settle(&result);
                result
            }
        }
    }
}

type Groups<T> = Mutex<HashMap<RequestFingerprint, Waiters<T>>>;

fn lock<T>(groups: &Groups<T>) -> MutexGuard<'_, HashMap<RequestFingerprint, Waiters<T>>> {
    groups.lock().unwrap_or_else(PoisonError::into_inner)
}

struct GroupGuard<'a, T> {
    groups: &'a Groups<T>,
    fingerprint: Option<RequestFingerprint>,
}

impl<T: Clone> GroupGuard<'_, T> {
    fn settle(&mut self, result: &Settled<T>) {
        let Some(fingerprint) = self.fingerprint.take() else {
            return;
        };
        let waiters = lock(self.groups).remove(&fingerprint).unwrap_or_default();
        if !waiters.is_empty() {
            debug!(fingerprint = %fingerprint, waiters = waiters.len(), "fanning out settled request");
        }
        for waiter in waiters {
            // A waiter that stopped listening has nothing left to observe.
            let _ = waiter.send(result.clone());
        }
    }
}

impl<T> Drop for GroupGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(fingerprint) = self.fingerprint.take() {
            // Dropping the senders resolves every waiter as cancelled.
            lock(self.groups).remove(&fingerprint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fingerprint(path: &str) -> RequestFingerprint {
        crate::fingerprint::fingerprint(&crate::request::OutboundRequest::get(path))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let queue: DedupQueue<u32> = DedupQueue::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let leader = {
            let queue = queue.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                queue
                    .enqueue(fingerprint("/a"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = gate.await;
                        Ok(7)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(queue.in_flight(), 1);

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    queue
                        .enqueue(fingerprint("/a"), || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(0)
                        })
                        .await
                })
            })
            .collect();
        tokio::task::yield_now().await;
        let _ = release.send(());

        assert_eq!(leader.await.ok(), Some(Ok(7)));
        for waiter in waiters {
            assert_eq!(waiter.await.ok(), Some(Ok(7)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn errors_fan_out_identically() {
        let queue: DedupQueue<u32> = DedupQueue::new();
        let (release, gate) = oneshot::channel::<()>();
        let failure = RequestError::Api {
            status: 422,
            message: "invalid".into(),
        };

        let leader = {
            let queue = queue.clone();
            let failure = failure.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(fingerprint("/b"), || async move {
                        let _ = gate.await;
                        Err(failure)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(fingerprint("/b"), || async { Ok(1) }).await })
        };
        tokio::task::yield_now().await;
        let _ = release.send(());

        assert_eq!(leader.await.ok(), Some(Err(failure.clone())));
        assert_eq!(waiter.await.ok(), Some(Err(failure)));
    }

    #[tokio::test]
    async fn settled_groups_are_evicted() {
        let queue: DedupQueue<u32> = DedupQueue::new();
        let calls = AtomicUsize::new(0);
        for expected in 1..=2 {
            let value = queue
                .enqueue(fingerprint("/c"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(expected)
                })
                .await;
            assert_eq!(value, Ok(expected));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_evicts_and_cancels_waiters() {
        let joins = Arc::new(AtomicUsize::new(0));
        let queue: DedupQueue<u32> = {
            let joins = Arc::clone(&joins);
            DedupQueue::new().with_join_hook(move |_| {
                joins.fetch_add(1, Ordering::SeqCst);
            })
        };

        let leader = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(fingerprint("/d"), || std::future::pending::<Settled<u32>>())
                    .await
            })
        };
        tokio::task::yield_now().await;
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(fingerprint("/d"), || async { Ok(1) }).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(joins.load(Ordering::SeqCst), 1);

        leader.abort();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(outcome, Ok(Ok(Err(RequestError::Cancelled)))));
        assert!(!queue.is_in_flight(&fingerprint("/d")));
    }
}
