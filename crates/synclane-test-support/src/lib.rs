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

//! Shared test helpers used across integration suites.
//! Layout: fixtures.rs (canned responses and clients), mocks.rs (scripted transport), assert.rs (test assertions).

pub mod assert;
pub mod fixtures;
pub mod mocks;
