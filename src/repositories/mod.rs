//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM
//! operations for database entities. Lifecycle writes go through guarded
//! UPDATEs and log appends through bare INSERTs so concurrent event channels
//! never lose updates.

pub mod job;
pub mod product;

pub use job::{JobRepository, TransitionOutcome};
pub use product::{ProductPage, ProductQuery, ProductRepository, SortField, SortOrder};
