//! Database migrations for the scrapeflow engine.
//!
//! This module contains all database migrations using SeaORM Migration.

pub use sea_orm_migration::prelude::*;

mod m2026_06_10_090000_create_jobs;
mod m2026_06_10_090100_create_job_logs;
mod m2026_06_10_090200_create_products;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_06_10_090000_create_jobs::Migration),
            Box::new(m2026_06_10_090100_create_job_logs::Migration),
            Box::new(m2026_06_10_090200_create_products::Migration),
        ]
    }
}
