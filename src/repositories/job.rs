//! Job repository for database operations
//!
//! This module provides the JobRepository struct which encapsulates SeaORM
//! operations for the jobs and job_logs tables. Every lifecycle mutation is a
//! single guarded UPDATE whose filter encodes the legal predecessor states, so
//! the transition check and the write cannot be separated by a concurrent
//! writer. Log lines are individual INSERTs, which makes appends from the
//! stdout, stderr and callback channels atomic with respect to each other.

use anyhow::{Result, anyhow};
use chrono::Utc;
use sea_orm::prelude::*;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::job::{self, JobStatus, ProgressSnapshot, ResultsSummary};
use crate::models::job_log::{self, LogSource};
use crate::models::{Job, JobLog};

/// Result of a guarded lifecycle write.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The guarded update matched and the new state is durable.
    Applied(job::Model),
    /// The job exists but its current status forbids the write.
    Rejected { current: String },
    /// No job with the given id.
    NotFound,
}

/// Repository for job and job-log database operations
#[derive(Debug, Clone)]
pub struct JobRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
    /// Retained log lines per job, 0 disables pruning
    max_log_lines: u64,
}

impl JobRepository {
    /// Creates a new JobRepository instance
    pub fn new(db: Arc<DatabaseConnection>, max_log_lines: u64) -> Self {
        Self { db, max_log_lines }
    }

    /// Creates a pending job record with a freshly generated id.
    ///
    /// Uniqueness of the id is enforced by the primary-key constraint; a
    /// collision surfaces as an insert error rather than overwriting an
    /// existing job.
    pub async fn create(
        &self,
        product_name: &str,
        max_products: i32,
        max_pages: i32,
    ) -> Result<job::Model> {
        let id = Uuid::new_v4();
        let now: DateTimeWithTimeZone = Utc::now().into();

        let record = job::ActiveModel {
            id: Set(id),
            product_name: Set(product_name.to_string()),
            max_products: Set(max_products),
            max_pages: Set(max_pages),
            status: Set(JobStatus::Pending.as_str().to_string()),
            progress: Set(None),
            results: Set(None),
            error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            completed_at: Set(None),
        };
        record.insert(&*self.db).await?;

        // For SQLite, query the record directly since we already know the ID
        let fetched = Job::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("job not persisted"))
    }

    /// Finds a job by its id
    pub async fn find(&self, job_id: Uuid) -> Result<Option<job::Model>> {
        Ok(Job::find_by_id(job_id).one(&*self.db).await?)
    }

    /// Lists all jobs, most recently created first, with their log lines in
    /// append order.
    pub async fn list_with_logs(&self) -> Result<Vec<(job::Model, Vec<job_log::Model>)>> {
        let jobs = Job::find()
            .order_by_desc(job::Column::CreatedAt)
            .order_by_desc(job::Column::Id)
            .all(&*self.db)
            .await?;

        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let lines = JobLog::find()
            .filter(job_log::Column::JobId.is_in(ids))
            .order_by_asc(job_log::Column::Id)
            .all(&*self.db)
            .await?;

        let mut grouped: HashMap<Uuid, Vec<job_log::Model>> = HashMap::new();
        for line in lines {
            grouped.entry(line.job_id).or_default().push(line);
        }

        Ok(jobs
            .into_iter()
            .map(|j| {
                let logs = grouped.remove(&j.id).unwrap_or_default();
                (j, logs)
            })
            .collect())
    }

    /// Returns a job's log lines in append order
    pub async fn logs_for(&self, job_id: Uuid) -> Result<Vec<job_log::Model>> {
        Ok(JobLog::find()
            .filter(job_log::Column::JobId.eq(job_id))
            .order_by_asc(job_log::Column::Id)
            .all(&*self.db)
            .await?)
    }

    /// Appends one log line for a job.
    ///
    /// A bare INSERT, never a read-modify-write of the job record, so
    /// concurrent appends from different channels cannot lose lines.
    pub async fn append_log(&self, job_id: Uuid, source: LogSource, line: &str) -> Result<()> {
        let entry = job_log::ActiveModel {
            id: NotSet,
            job_id: Set(job_id),
            source: Set(source.as_str().to_string()),
            line: Set(line.to_string()),
            logged_at: Set(Utc::now().into()),
        };
        JobLog::insert(entry).exec(&*self.db).await?;

        if self.max_log_lines > 0 {
            self.prune_logs(job_id).await?;
        }
        Ok(())
    }

    /// Applies a status transition if the job's current status permits it.
    ///
    /// The legal predecessors of `next` become part of the UPDATE filter, so
    /// a job that has already reached a terminal state matches zero rows and
    /// the write is reported as [`TransitionOutcome::Rejected`] without ever
    /// touching the record. On success a synthesized log line records the
    /// transition; `error` is stored in the error column and `completed_at`
    /// is stamped for terminal states.
    pub async fn apply_status(
        &self,
        job_id: Uuid,
        next: JobStatus,
        detail: Option<&str>,
        error: Option<&str>,
    ) -> Result<TransitionOutcome> {
        let predecessors: Vec<&'static str> = JobStatus::legal_predecessors(next)
            .iter()
            .map(|s| s.as_str())
            .collect();
        if predecessors.is_empty() {
            return self.transition_rejection(job_id).await;
        }

        let now: DateTimeWithTimeZone = Utc::now().into();
        let mut update = Job::update_many()
            .col_expr(job::Column::Status, Expr::value(next.as_str()))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.is_in(predecessors));
        if let Some(error) = error {
            update = update.col_expr(job::Column::Error, Expr::value(error));
        }
        if next.is_terminal() {
            update = update.col_expr(job::Column::CompletedAt, Expr::value(now));
        }

        let result = update.exec(&*self.db).await?;
        if result.rows_affected == 0 {
            return self.transition_rejection(job_id).await;
        }

        let line = match detail {
            Some(detail) => format!("Status changed to {}: {}", next, detail),
            None => format!("Status changed to {}", next),
        };
        self.append_log(job_id, LogSource::System, &line).await?;

        let model = self
            .find(job_id)
            .await?
            .ok_or_else(|| anyhow!("job '{}' vanished mid-update", job_id))?;
        Ok(TransitionOutcome::Applied(model))
    }

    /// Replaces the progress snapshot for a job that has not finished yet.
    ///
    /// Last write wins; the snapshot is set in one guarded UPDATE and a
    /// synthesized log line records the report. Terminal jobs reject the
    /// write.
    pub async fn apply_progress(
        &self,
        job_id: Uuid,
        progress: &ProgressSnapshot,
    ) -> Result<TransitionOutcome> {
        let snapshot = serde_json::to_value(progress)?;
        let now: DateTimeWithTimeZone = Utc::now().into();

        let result = Job::update_many()
            .col_expr(job::Column::Progress, Expr::value(snapshot))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Status.is_in([
                JobStatus::Pending.as_str(),
                JobStatus::Running.as_str(),
            ]))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return self.transition_rejection(job_id).await;
        }

        let line = format!(
            "Progress: {:.1}% (product {}/{}, page {})",
            progress.percentage,
            progress.current_product,
            progress.total_products,
            progress.current_page
        );
        self.append_log(job_id, LogSource::System, &line).await?;

        let model = self
            .find(job_id)
            .await?
            .ok_or_else(|| anyhow!("job '{}' vanished mid-update", job_id))?;
        Ok(TransitionOutcome::Applied(model))
    }

    /// Finalizes a job with its result summary.
    ///
    /// Results are written at most once: the UPDATE filter requires the
    /// results column to still be null. A job the worker already marked
    /// completed over the callback channel is still finalizable, which is why
    /// `completed` appears in the status filter alongside `running`.
    pub async fn finalize_completed(
        &self,
        job_id: Uuid,
        results: &ResultsSummary,
    ) -> Result<TransitionOutcome> {
        let summary = serde_json::to_value(results)?;
        let now: DateTimeWithTimeZone = Utc::now().into();

        let result = Job::update_many()
            .col_expr(
                job::Column::Status,
                Expr::value(JobStatus::Completed.as_str()),
            )
            .col_expr(job::Column::Results, Expr::value(summary))
            .col_expr(job::Column::CompletedAt, Expr::value(now))
            .col_expr(job::Column::UpdatedAt, Expr::value(now))
            .filter(job::Column::Id.eq(job_id))
            .filter(job::Column::Results.is_null())
            .filter(job::Column::Status.is_in([
                JobStatus::Running.as_str(),
                JobStatus::Completed.as_str(),
            ]))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return self.transition_rejection(job_id).await;
        }

        let model = self
            .find(job_id)
            .await?
            .ok_or_else(|| anyhow!("job '{}' vanished mid-update", job_id))?;
        Ok(TransitionOutcome::Applied(model))
    }

    /// Distinguishes "job missing" from "status forbids the write" after a
    /// guarded update matched zero rows.
    async fn transition_rejection(&self, job_id: Uuid) -> Result<TransitionOutcome> {
        match self.find(job_id).await? {
            Some(job) => Ok(TransitionOutcome::Rejected {
                current: job.status,
            }),
            None => Ok(TransitionOutcome::NotFound),
        }
    }

    /// Drops the oldest lines beyond the retention cap.
    async fn prune_logs(&self, job_id: Uuid) -> Result<()> {
        // The row at offset cap-1 (newest first) is the oldest line kept.
        let cutoff = JobLog::find()
            .filter(job_log::Column::JobId.eq(job_id))
            .order_by_desc(job_log::Column::Id)
            .offset(self.max_log_lines - 1)
            .one(&*self.db)
            .await?;

        if let Some(row) = cutoff {
            JobLog::delete_many()
                .filter(job_log::Column::JobId.eq(job_id))
                .filter(job_log::Column::Id.lt(row.id))
                .exec(&*self.db)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    async fn setup_repo(max_log_lines: u64) -> JobRepository {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect test db");
        Migrator::up(&db, None).await.expect("apply migrations");
        JobRepository::new(Arc::new(db), max_log_lines)
    }

    fn applied(outcome: TransitionOutcome) -> job::Model {
        match outcome {
            TransitionOutcome::Applied(model) => model,
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn create_starts_pending_with_distinct_ids() {
        let repo = setup_repo(0).await;

        let first = repo.create("Wireless Mouse", 5, 1).await.unwrap();
        let second = repo.create("Wireless Mouse", 5, 1).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.status, "pending");
        assert!(first.progress.is_none());
        assert!(first.results.is_none());
        assert!(first.completed_at.is_none());

        let found = repo.find(first.id).await.unwrap().unwrap();
        assert_eq!(found.product_name, "Wireless Mouse");
    }

    #[tokio::test]
    async fn lifecycle_transitions_follow_the_table() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();

        let running = applied(
            repo.apply_status(job.id, JobStatus::Running, Some("worker spawned"), None)
                .await
                .unwrap(),
        );
        assert_eq!(running.status, "running");

        let completed = applied(
            repo.finalize_completed(
                job.id,
                &ResultsSummary {
                    total_scraped: 3,
                    pages_processed: 1,
                    output_files: vec!["csv/laptop.csv".to_string()],
                },
            )
            .await
            .unwrap(),
        );
        assert_eq!(completed.status, "completed");
        assert!(completed.results.is_some());
        assert!(completed.completed_at.is_some());

        // Terminal state rejects any further transition.
        match repo
            .apply_status(job.id, JobStatus::Running, None, None)
            .await
            .unwrap()
        {
            TransitionOutcome::Rejected { current } => assert_eq!(current, "completed"),
            other => panic!("expected Rejected, got {:?}", other),
        }
        let unchanged = repo.find(job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, "completed");
    }

    #[tokio::test]
    async fn spawn_failure_moves_pending_to_failed_with_error() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();

        let failed = applied(
            repo.apply_status(
                job.id,
                JobStatus::Failed,
                Some("no such file or directory"),
                Some("no such file or directory"),
            )
            .await
            .unwrap(),
        );
        assert_eq!(failed.status, "failed");
        assert_eq!(failed.error.as_deref(), Some("no such file or directory"));
        assert!(failed.completed_at.is_some());
    }

    #[tokio::test]
    async fn appended_lines_keep_arrival_order() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();

        repo.append_log(job.id, LogSource::Stdout, "Starting scrape")
            .await
            .unwrap();
        repo.append_log(job.id, LogSource::Stderr, "retrying page 1")
            .await
            .unwrap();
        repo.append_log(job.id, LogSource::Callback, "worker checkpoint")
            .await
            .unwrap();

        let lines = repo.logs_for(job.id).await.unwrap();
        assert_eq!(
            lines.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(),
            vec!["Starting scrape", "retrying page 1", "worker checkpoint"]
        );
        assert_eq!(lines[0].source, "stdout");
        assert_eq!(lines[1].source, "stderr");
        assert_eq!(lines[2].source, "callback");
    }

    #[tokio::test]
    async fn status_change_appends_synthesized_line() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();

        applied(
            repo.apply_status(job.id, JobStatus::Running, Some("worker spawned"), None)
                .await
                .unwrap(),
        );

        let lines = repo.logs_for(job.id).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line, "Status changed to running: worker spawned");
        assert_eq!(lines[0].source, "system");
    }

    #[tokio::test]
    async fn progress_is_last_write_wins_and_rejected_after_terminal() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();
        applied(
            repo.apply_status(job.id, JobStatus::Running, None, None)
                .await
                .unwrap(),
        );

        let early = ProgressSnapshot {
            current_page: 1,
            current_product: 2,
            total_products: 10,
            percentage: 20.0,
        };
        let late = ProgressSnapshot {
            current_page: 1,
            current_product: 7,
            total_products: 10,
            percentage: 70.0,
        };
        applied(repo.apply_progress(job.id, &early).await.unwrap());
        let updated = applied(repo.apply_progress(job.id, &late).await.unwrap());
        let stored: ProgressSnapshot =
            serde_json::from_value(updated.progress.clone().unwrap()).unwrap();
        assert_eq!(stored, late);

        applied(
            repo.apply_status(job.id, JobStatus::Stopped, Some("stop requested"), None)
                .await
                .unwrap(),
        );
        match repo.apply_progress(job.id, &early).await.unwrap() {
            TransitionOutcome::Rejected { current } => assert_eq!(current, "stopped"),
            other => panic!("expected Rejected, got {:?}", other),
        }
        let frozen = repo.find(job.id).await.unwrap().unwrap();
        let still: ProgressSnapshot =
            serde_json::from_value(frozen.progress.clone().unwrap()).unwrap();
        assert_eq!(still, late);
    }

    #[tokio::test]
    async fn results_are_written_at_most_once() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();
        applied(
            repo.apply_status(job.id, JobStatus::Running, None, None)
                .await
                .unwrap(),
        );

        let first = ResultsSummary {
            total_scraped: 3,
            pages_processed: 2,
            output_files: Vec::new(),
        };
        applied(repo.finalize_completed(job.id, &first).await.unwrap());

        let second = ResultsSummary {
            total_scraped: 99,
            pages_processed: 9,
            output_files: Vec::new(),
        };
        match repo.finalize_completed(job.id, &second).await.unwrap() {
            TransitionOutcome::Rejected { current } => assert_eq!(current, "completed"),
            other => panic!("expected Rejected, got {:?}", other),
        }

        let stored = repo.find(job.id).await.unwrap().unwrap();
        let summary: ResultsSummary = serde_json::from_value(stored.results.unwrap()).unwrap();
        assert_eq!(summary.total_scraped, 3);
    }

    #[tokio::test]
    async fn callback_completed_then_finalize_still_records_results() {
        let repo = setup_repo(0).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();
        applied(
            repo.apply_status(job.id, JobStatus::Running, None, None)
                .await
                .unwrap(),
        );

        // Worker reported completion over the callback channel first.
        applied(
            repo.apply_status(job.id, JobStatus::Completed, Some("scrape finished"), None)
                .await
                .unwrap(),
        );

        // Exit-driven finalize still lands because results are unset.
        let summary = ResultsSummary {
            total_scraped: 2,
            pages_processed: 1,
            output_files: Vec::new(),
        };
        let finalized = applied(repo.finalize_completed(job.id, &summary).await.unwrap());
        assert_eq!(finalized.status, "completed");
        assert!(finalized.results.is_some());
    }

    #[tokio::test]
    async fn retention_cap_keeps_newest_lines() {
        let repo = setup_repo(3).await;
        let job = repo.create("laptop", 5, 1).await.unwrap();

        for n in 1..=5 {
            repo.append_log(job.id, LogSource::Stdout, &format!("line {}", n))
                .await
                .unwrap();
        }

        let lines = repo.logs_for(job.id).await.unwrap();
        assert_eq!(
            lines.iter().map(|l| l.line.as_str()).collect::<Vec<_>>(),
            vec!["line 3", "line 4", "line 5"]
        );
    }

    #[tokio::test]
    async fn unknown_job_reports_not_found() {
        let repo = setup_repo(0).await;

        match repo
            .apply_status(Uuid::new_v4(), JobStatus::Running, None, None)
            .await
            .unwrap()
        {
            TransitionOutcome::NotFound => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
        match repo
            .apply_progress(Uuid::new_v4(), &ProgressSnapshot::default())
            .await
            .unwrap()
        {
            TransitionOutcome::NotFound => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn listing_returns_newest_first_with_grouped_logs() {
        let repo = setup_repo(0).await;
        let older = repo.create("first", 5, 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = repo.create("second", 5, 1).await.unwrap();

        repo.append_log(older.id, LogSource::Stdout, "old line")
            .await
            .unwrap();
        repo.append_log(newer.id, LogSource::Stdout, "new line")
            .await
            .unwrap();

        let listed = repo.list_with_logs().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].0.id, newer.id);
        assert_eq!(listed[0].1[0].line, "new line");
        assert_eq!(listed[1].0.id, older.id);
        assert_eq!(listed[1].1[0].line, "old line");
    }
}
