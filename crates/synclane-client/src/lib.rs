#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![warn(unused, unreachable_pub)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

//! Client-side data synchronization for Synclane.
//!
//! A [`SyncClient`] collapses identical concurrent requests, retries business
//! errors, detects session expiry and cancels what is left pending. On top
//! of it, [`Query`] tracks one async operation, [`Synchronizer`] assembles
//! paginated result sets with stale-while-revalidate patches, and
//! [`PollingScheduler`] refreshes either of them after continued user
//! presence.
//!
//! Layout: `request.rs`/`transport.rs` (wire models and the network seam),
//! `fingerprint.rs`/`dedup.rs` (request collapsing), `cancel.rs` (tokens and
//! registry), `classify.rs` (retry and error rules), `session.rs`/`headers.rs`
//! (persisted state), `client.rs` (the adapter), `logging.rs` (subscriber
//! setup), `query.rs`, `pages.rs`, `synchronizer.rs`, `scheduler.rs` (state
//! machines).

pub mod cancel;
pub mod classify;
pub mod client;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod logging;
pub mod pages;
pub mod query;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod synchronizer;
pub mod transport;

pub use cancel::{CancellationRegistry, CancellationToken, RegisteredToken, RequestController};
pub use client::{ClientBuilder, ControllerCallback, HEADER_REQUEST_ID, RequestOptions, SyncClient};
pub use dedup::DedupQueue;
pub use error::{
    CANCELLED_MESSAGE, ClientError, GENERIC_ERROR_MESSAGE, RequestError, SESSION_TIMEOUT_MESSAGE,
    StoreError, StoreResult,
};
pub use fingerprint::{RequestFingerprint, fingerprint};
pub use headers::{HeaderRotator, HeaderTable};
pub use logging::install_logging;
pub use pages::{FinderOutput, PageKey, PageMap, PageResponse, flatten_pages, infer_has_next_page};
pub use query::{Query, QueryState, SessionExpiryHandler};
pub use request::{HeaderMap, Method, OutboundRequest, RequestBody, TransportResponse, normalize_headers};
pub use scheduler::{BLUR_THRESHOLD, MIN_REFRESH_INTERVAL, PollStatus, PollingScheduler, SchedulerOptions};
pub use session::{JsonFileStore, KeyValueStore, MemoryStore, SessionStore, StoredValue};
pub use synchronizer::{
    FinderFuture, PageParams, PageRequest, PageSnapshot, StaleWriter, Synchronizer,
    SynchronizerBuilder, SynchronizerOptions,
};
pub use transport::{ReqwestTransport, Transport, TransportError};
