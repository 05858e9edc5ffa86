//! Job log entity model
//!
//! Each row is one appended log line for a job. Inserting a row is the
//! engine's atomic append primitive: the auto-increment id preserves arrival
//! order and concurrent writers from different channels never clobber each
//! other.

use std::fmt;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_logs")]
pub struct Model {
    /// Monotonic append position (primary key)
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Job this line belongs to
    pub job_id: Uuid,

    /// Channel the line arrived on (stdout, stderr, callback, system)
    pub source: String,

    /// The log line itself
    pub line: String,

    /// Timestamp when the line was recorded
    pub logged_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id"
    )]
    Job,
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Which channel a log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Captured from the worker's stdout pipe
    Stdout,
    /// Captured from the worker's stderr pipe
    Stderr,
    /// Posted by the worker over the HTTP callback channel
    Callback,
    /// Emitted by the engine itself (spawn failures, ingestion summaries)
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::Callback => "callback",
            LogSource::System => "system",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
