//! Durable job storage and the lease queue that feeds the worker pool.
//!
//! Both live in one SQLite database:
//!
//! - [`JobStore`]: job records with compare-and-set status transitions
//! - [`JobQueue`]: at-least-once delivery of job ids with lease expiry

mod db;
mod jobs;
mod queue;

pub use db::{Database, StoreError};
pub use jobs::{JobQuery, JobStore};
pub use queue::{Delivery, JobQueue};
