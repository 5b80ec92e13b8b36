//! Persistent implementations of the analytics store contracts.
//!
//! In-memory versions live next to the traits in `devpulse-analytics`; this
//! module holds the Postgres one used in production wiring.

mod postgres;

pub use postgres::PostgresAnalyticsStore;
