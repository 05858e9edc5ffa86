//! Migration to create the job_logs table.
//!
//! One row per log line. Inserting a row is the engine's atomic append
//! primitive, so two ingestion channels writing the same job concurrently can
//! never lose each other's lines; the autoincrement id preserves arrival
//! order for reads.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(JobLogs::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(JobLogs::JobId).uuid().not_null())
                    .col(
                        ColumnDef::new(JobLogs::Source)
                            .text()
                            .not_null()
                            .default("system"),
                    )
                    .col(ColumnDef::new(JobLogs::Line).text().not_null())
                    .col(
                        ColumnDef::new(JobLogs::LoggedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_job_logs_job_id")
                            .from(JobLogs::Table, JobLogs::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Ordered per-job reads walk (job_id, id).
        manager
            .create_index(
                Index::create()
                    .name("idx_job_logs_job_id_id")
                    .table(JobLogs::Table)
                    .col(JobLogs::JobId)
                    .col(JobLogs::Id)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("idx_job_logs_job_id_id").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(JobLogs::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobLogs {
    Table,
    Id,
    JobId,
    Source,
    Line,
    LoggedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
