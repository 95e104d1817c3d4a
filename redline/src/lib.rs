//! Asynchronous contract risk analysis pipeline.
//!
//! Documents are submitted for analysis against a service tier, paid for in
//! credits. Admission atomically debits the cost and creates a pending
//! record, then enqueues a durable job. A small worker pool claims jobs,
//! extracts and (when oversized) relevance-filters the document text, calls
//! the tier's whitelisted model, and writes the structured result back.
//! Failures are retried with exponential backoff until a fixed attempt
//! budget is spent, then dead-lettered with a sanitized user-facing message.
//!
//! The main abstraction seams are traits: [`store::AnalysisStore`],
//! [`queue::JobQueue`], [`documents::DocumentStore`], and
//! [`model::ModelClient`] each have a Postgres-or-HTTP implementation for
//! production and an in-memory one for tests.

pub mod app;
pub mod config;
pub mod debug_gate;
pub mod documents;
pub mod errors;
pub mod model;
pub mod preprocess;
pub mod prompts;
pub mod queue;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
pub mod tiers;
pub mod types;
pub mod worker;

pub use errors::{Error, Result};
