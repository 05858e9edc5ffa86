//! # Data Models
//!
//! This module contains all the data models used throughout the Scrapeflow API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod job;
pub mod job_log;
pub mod product;

pub use job::Entity as Job;
pub use job_log::Entity as JobLog;
pub use product::Entity as Product;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "scrapeflow".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
