//! Job entity model
//!
//! This module contains the SeaORM entity model for the jobs table, which
//! represents one bounded scrape request, plus the lifecycle status type that
//! encodes which transitions are legal.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use utoipa::ToSchema;
use uuid::Uuid;

/// Job entity representing one scrape request and its lifecycle state
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    /// Unique identifier for the job (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Product the worker searches for
    pub product_name: String,

    /// Upper bound on products the worker collects
    pub max_products: i32,

    /// Upper bound on result pages the worker visits
    pub max_pages: i32,

    /// Current lifecycle status (pending, running, completed, failed, stopped)
    pub status: String,

    /// Last-write-wins progress snapshot reported by the worker
    #[sea_orm(column_type = "JsonBinary")]
    pub progress: Option<JsonValue>,

    /// Result summary, populated exactly once on completion
    #[sea_orm(column_type = "JsonBinary")]
    pub results: Option<JsonValue>,

    /// Failure description, set when the job fails
    pub error: Option<String>,

    /// Timestamp when the job was created
    pub created_at: DateTimeWithTimeZone,

    /// Timestamp of the most recent mutation
    pub updated_at: DateTimeWithTimeZone,

    /// Timestamp when the job reached a terminal state with results
    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_log::Entity")]
    JobLog,
    #[sea_orm(has_many = "super::product::Entity")]
    Product,
}

impl Related<super::job_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobLog.def()
    }
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Product.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Job lifecycle status.
///
/// `pending` is the initial state; `completed`, `failed` and `stopped` are
/// terminal. Every status write in the engine is validated against
/// [`JobStatus::can_transition_to`], so a terminal job can never be revived
/// regardless of which ingestion channel attempts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Whether no further transition is permitted out of this status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// The legal-transition table.
    ///
    /// Allowed: pending -> running, pending -> failed (spawn failure),
    /// running -> completed, running -> failed, running -> stopped.
    /// Everything else, including any move out of a terminal state, is
    /// rejected.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Stopped)
        )
    }

    /// The statuses from which `next` may legally be entered. Used to build
    /// guarded UPDATE filters so the transition check and the write are one
    /// atomic statement.
    pub fn legal_predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed => &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Stopped => &[JobStatus::Running],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Last-write-wins progress snapshot stored on the job record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    #[serde(default)]
    pub current_page: u32,
    #[serde(default)]
    pub current_product: u32,
    #[serde(default)]
    pub total_products: u32,
    #[serde(default)]
    pub percentage: f64,
}

/// Result summary stored on the job record when it completes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultsSummary {
    /// Count of rows actually persisted (not attempted)
    pub total_scraped: u64,
    /// Maximum page number among accepted rows
    pub pages_processed: u32,
    /// Output files the worker produced, relative to the output directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_files: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopped));

        // No revival out of terminal states.
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Stopped] {
            for next in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Stopped,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }

        // No skipping pending -> completed/stopped, no self-loops.
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Stopped));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn predecessors_agree_with_transition_table() {
        for next in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            for from in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Stopped,
            ] {
                let listed = JobStatus::legal_predecessors(next).contains(&from);
                assert_eq!(listed, from.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }

        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn progress_snapshot_uses_camel_case() {
        let snapshot = ProgressSnapshot {
            current_page: 2,
            current_product: 7,
            total_products: 10,
            percentage: 70.0,
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["currentPage"], 2);
        assert_eq!(value["currentProduct"], 7);
        assert_eq!(value["totalProducts"], 10);
        assert_eq!(value["percentage"], 70.0);
    }
}
