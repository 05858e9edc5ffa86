//! Migration to create the products table.
//!
//! Products are created only by the result ingestion pipeline after a worker
//! exits cleanly. The unique (job_id, asin) index is what makes re-ingestion
//! of the same output file duplicate-tolerant instead of duplicating rows.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Products::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Products::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Products::JobId).uuid().not_null())
                    .col(ColumnDef::new(Products::Asin).text().not_null())
                    .col(ColumnDef::new(Products::Title).text().not_null())
                    .col(ColumnDef::new(Products::Price).text().null())
                    .col(ColumnDef::new(Products::OriginalPrice).text().null())
                    .col(ColumnDef::new(Products::Rating).double().null())
                    .col(ColumnDef::new(Products::ReviewCount).integer().null())
                    .col(ColumnDef::new(Products::ImageUrl).text().null())
                    .col(ColumnDef::new(Products::ProductUrl).text().null())
                    .col(
                        ColumnDef::new(Products::BestSeller)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Products::DeliveryInfo).text().null())
                    .col(
                        ColumnDef::new(Products::PageNumber)
                            .integer()
                            .not_null()
                            .default(1),
                    )
                    .col(
                        ColumnDef::new(Products::ScrapedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(Products::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_products_job_id")
                            .from(Products::Table, Products::JobId)
                            .to(Jobs::Table, Jobs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_products_job_id_asin")
                    .table(Products::Table)
                    .col(Products::JobId)
                    .col(Products::Asin)
                    .unique()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(Index::drop().name("uq_products_job_id_asin").to_owned())
            .await?;

        manager
            .drop_table(Table::drop().table(Products::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Products {
    Table,
    Id,
    JobId,
    Asin,
    Title,
    Price,
    OriginalPrice,
    Rating,
    ReviewCount,
    ImageUrl,
    ProductUrl,
    BestSeller,
    DeliveryInfo,
    PageNumber,
    ScrapedAt,
    CreatedAt,
}

#[derive(DeriveIden)]
enum Jobs {
    Table,
    Id,
}
