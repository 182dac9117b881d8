//! Cooperative cancellation primitives.
//!
//! # Design
//! - A token is a shared flag plus a watch channel so waiters wake without polling.
//! - The registry tracks every live token on one client; guards deregister on drop.
//! - Bulk cancellation snapshots the live set before cancelling anything so
//!   cancellation callbacks cannot mutate the set being walked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::fingerprint::RequestFingerprint;

/// Shared cancellation flag.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    state: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Cancel the token. Returns `true` if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.state.send_replace(true)
    }

    /// Whether the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.state.subscribe();
        // The sender lives as long as `self`, so the wait only ends on cancellation.
        let _ = receiver.wait_for(|cancelled| *cancelled).await;
    }
}

/// Handle handed to callers that want to abort one specific request.
#[derive(Debug, Clone)]
pub struct RequestController {
    token: CancellationToken,
}

impl RequestController {
    pub(crate) const fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Abort the request this controller belongs to.
    pub fn cancel_request(&self) {
        self.token.cancel();
    }

    /// Whether the request was aborted.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug)]
struct Entry {
    token: CancellationToken,
    fingerprint: Option<RequestFingerprint>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, Entry>>,
}

/// Client-wide set of live cancellation tokens.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    inner: Arc<RegistryInner>,
}

impl CancellationRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a fresh token until the returned guard drops.
    #[must_use]
    pub fn register(&self, fingerprint: Option<RequestFingerprint>) -> RegisteredToken {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.entries().insert(
            id,
            Entry {
                token: token.clone(),
                fingerprint,
            },
        );
        RegisteredToken {
            id,
            token,
            registry: self.clone(),
        }
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no token is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Cancel every live token. Returns how many flipped.
    pub fn cancel_all(&self) -> usize {
        cancel_each(self.snapshot(|_| true))
    }

    /// Cancel every live token except those issued for `fingerprint`.
    ///
    /// Callers sharing the excluded fingerprint settle with the same value as
    /// the request that triggered the cancellation.
    pub fn cancel_all_except(&self, fingerprint: &RequestFingerprint) -> usize {
        cancel_each(self.snapshot(|entry| entry.fingerprint.as_ref() != Some(fingerprint)))
    }

    fn snapshot(&self, keep: impl Fn(&Entry) -> bool) -> Vec<CancellationToken> {
        self.entries()
            .values()
            .filter(|entry| keep(entry))
            .map(|entry| entry.token.clone())
            .collect()
    }

    fn remove(&self, id: u64) {
        self.entries().remove(&id);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, Entry>> {
        self.inner
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn cancel_each(tokens: Vec<CancellationToken>) -> usize {
    tokens.into_iter().filter(|token| token.cancel()).count()
}

/// Registry membership for one token; deregisters on drop.
#[derive(Debug)]
pub struct RegisteredToken {
    id: u64,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl RegisteredToken {
    /// The tracked token.
    #[must_use]
    pub const fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Controller exposing `cancel_request` for this token.
    #[must_use]
    pub fn controller(&self) -> RequestController {
        RequestController::new(self.token.clone())
    }
}

impl Drop for RegisteredToken {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
