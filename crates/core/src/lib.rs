//! `devpulse-core`: shared building blocks.
//!
//! Identifiers, the time-range value object and the domain error model. No
//! infrastructure concerns live here.

pub mod error;
pub mod id;
pub mod time_range;

pub use error::{DomainError, DomainResult};
pub use id::{RepositoryId, UserId};
pub use time_range::TimeRange;
