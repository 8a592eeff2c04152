//! Shared test utilities available to integration tests via the
//! `testkit` feature.
//!
//! - [`fake_venue`] — an in-memory [`crate::venue::VenueAdapter`] that
//!   records submitted orders and lets a test script push
//!   [`crate::venue::UserUpdate`] events on demand.
//! - [`domain`] — concise builders for markets and keys.

pub mod domain;
pub mod fake_venue;
