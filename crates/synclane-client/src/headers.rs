//! Default request headers shared by every call on one client.
//!
//! # Design
//! - Writes replace the whole table (last write wins) and are persisted.
//! - Request-level headers always win over defaults when merged.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use crate::error::StoreResult;
use crate::request::{HeaderMap, normalize_headers};
use crate::session::SessionStore;

/// Computes the next default headers from a successful response's headers and
/// the current defaults.
pub type HeaderRotator = Arc<dyn Fn(&HeaderMap, &HeaderMap) -> HeaderMap + Send + Sync>;

/// In-memory header table backed by the persisted session.
#[derive(Debug)]
pub struct HeaderTable {
    current: RwLock<HeaderMap>,
    session: SessionStore,
}

impl HeaderTable {
    /// Load the persisted defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted headers cannot be read.
    pub fn load(session: SessionStore) -> StoreResult<Self> {
        let current = session.default_headers()?;
        debug!(headers = current.len(), "loaded default request headers");
        Ok(Self {
            current: RwLock::new(current),
            session,
        })
    }

    /// Current defaults.
    #[must_use]
    pub fn snapshot(&self) -> HeaderMap {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Defaults overlaid with `request` headers.
    #[must_use]
    pub fn merged_with(&self, request: &HeaderMap) -> HeaderMap {
        let mut merged = self.snapshot();
        merged.extend(normalize_headers(request.iter().map(|(k, v)| (k, v.clone()))));
        merged
    }

    /// Re-read the defaults from durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted headers cannot be read.
    pub fn reload(&self) -> StoreResult<HeaderMap> {
        let stored = self.session.default_headers()?;
        self.swap(stored.clone());
        debug!(headers = stored.len(), "reloaded default request headers");
        Ok(stored)
    }

    /// Replace the defaults wholesale and persist them. Returns `false` when
    /// `next` equals the current table.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails; the in-memory table is already
    /// replaced at that point.
    pub fn replace(&self, next: HeaderMap) -> StoreResult<bool> {
        let next = normalize_headers(next);
        if self.snapshot() == next {
            return Ok(false);
        }
        self.swap(next.clone());
        self.session.set_default_headers(&next)?;
        Ok(true)
    }

    /// Apply `rotator` to a response's headers; returns the new table when it changed.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting the rotated table fails.
    pub fn rotate(
        &self,
        rotator: &HeaderRotator,
        response_headers: &HeaderMap,
    ) -> StoreResult<Option<HeaderMap>> {
        let next = rotator(response_headers, &self.snapshot());
        if self.replace(next)? {
            let rotated = self.snapshot();
            info!(headers = rotated.len(), "rotated default request headers");
            Ok(Some(rotated))
        } else {
            Ok(None)
        }
    }

    /// Drop every default in memory; durable state is untouched.
    pub fn clear(&self) {
        self.swap(HeaderMap::new());
    }

    fn swap(&self, next: HeaderMap) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
    }
}
