//! Worker pool for agentspan.
//!
//! Workers pull job references from the [`JobQueue`](agentspan_store::JobQueue),
//! convert each job's trace batch into a span tree, export the tree and record
//! the outcome in the [`JobStore`](agentspan_store::JobStore). Delivery is
//! at-least-once: conversion is deterministic and exports are keyed by job, so
//! running a job twice leaves the backend unchanged.

mod config;
mod retention;
mod worker;

pub use config::PipelineConfig;
pub use retention::{spawn_retention_sweep, sweep_once};
pub use worker::{Processed, WorkerPool};
