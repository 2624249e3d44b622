//! Dev build lifecycle tracking.
//!
//! A build request is validated, persisted and dispatched to one of two
//! pipeline engines: a monolithic job system polled on demand, or a fan-out
//! system whose per-platform sub-jobs report back through completion events.
//! Both converge on one [`models::BuildRecord`].

pub mod clients;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use config::DevBuildConfig;
pub use error::{ClientError, DevBuildError, Result};
pub use services::DevBuildService;
