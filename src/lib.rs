//! # Scrapeflow Library
//!
//! This library provides the core functionality for the Scrapeflow service:
//! the job lifecycle engine, the worker process supervisor, the result
//! ingestion pipeline and the HTTP API over them.

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod ingest;
pub mod models;
pub mod repositories;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub use migration;
