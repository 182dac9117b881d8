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

//! Client event bus for the Synclane workspace.
//!
//! The bus carries session-expiry notices, cancellation batches, header
//! rotation, and host activity signals (focus, pointer, visibility) between
//! the transport adapter, the state machines, and the polling scheduler.
//! Layout: `payloads.rs` (event types), `routing.rs` (bus + stream),
//! `error.rs` (publish errors).

pub mod error;
pub mod payloads;
pub mod routing;

pub use error::{EventBusError, EventBusResult};
pub use payloads::{CancelReason, ClientEvent, DEFAULT_REPLAY_CAPACITY, EventEnvelope, EventId};
pub use routing::{EventBus, EventStream};
