//! PostgreSQL implementations of the `eventide` storage seams: the durable
//! subscription checkpoint store and the historical event reader.
//!
//! Run [`MIGRATIONS`] against the pool before constructing either component.

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod event;
pub mod subscription;

/// Embedded schema migrations for the `events` and `subscriptions` tables.
pub static MIGRATIONS: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
