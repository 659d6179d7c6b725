//! # argus
//!
//! Real-time security-event analysis platform.
//!
//! Events arrive on a durable Postgres-backed queue (pgmq), a processor
//! persists them idempotently and maintains per-bucket rollups, and two
//! LLM-backed flows query the results: a synchronous analyze flow and an
//! asynchronous two-tier triage pipeline behind an HTTP API.

pub mod analyze;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod llm;
pub mod model;
pub mod processor;
pub mod prompts;
pub mod telemetry;
pub mod triage;
