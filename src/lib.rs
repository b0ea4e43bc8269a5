//! `eventide` is the subscription core of a persistent event store: it lets
//! external subscribers receive every appended event at least once, resuming
//! from a durable checkpoint after a restart.
//!
//! The crate is built around a few small components:
//!
//! - [`store::SubscriptionStore`], the durable checkpoint store keyed by
//!   `(stream key, subscription name)`;
//! - [`reader::EventReader`], snapshot reads of historical events in bounded
//!   batches;
//! - [`bus::Bus`], the in-process broadcast bus the writer publishes committed
//!   batches on;
//! - [`subscription::SubscriptionHub`], the public entry point that owns one
//!   actor per subscription and reconciles historical catch-up with live push.
//!
//! Delivery to a single subscriber is strictly monotonic in the subscription's
//! cursor; no ordering is guaranteed across distinct subscriptions.
//!
//! In-memory implementations of the storage seams live in [`inmemory`]; a
//! PostgreSQL implementation is provided by the `eventide-postgres` crate.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod bus;
pub mod event;
pub mod inmemory;
pub mod reader;
pub mod store;
pub mod subscription;
