//! # txflow
//!
//! Transactional request/reply work coordination.
//!
//! A coordinator dispatches work items to workers over durable queues, and
//! a completer applies the workers' replies. Every step pairs its store
//! mutation with its queue operation in one unit of work: Postgres with
//! pgmq in production, an in-memory backend for tests.

pub mod backend;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;
