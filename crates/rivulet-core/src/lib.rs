//! # Rivulet Core
//!
//! Core types, errors, and time abstractions for the Rivulet stream engine.
//!
//! This crate holds everything the storage and broker layers agree on and
//! performs no I/O of its own.
//!
//! ## Key Types
//!
//! - [`StreamId`]: Totally ordered `(ms, seq)` entry identifier with
//!   predecessor/successor arithmetic
//! - [`IdSpec`]: How an append chooses its identifier (`*`, `<ms>-*`, explicit)
//! - [`Fields`] / [`Entry`]: Ordered field list and the immutable stream record
//! - [`StreamError`]: Error kinds surfaced by every stream operation
//!
//! ## Key Traits
//!
//! - [`Clock`]: Millisecond time source, swappable for [`ManualClock`] in tests

pub mod clock;
pub mod entry;
pub mod error;
pub mod id;

// Re-export main types
pub use clock::*;
pub use entry::*;
pub use error::*;
pub use id::*;
