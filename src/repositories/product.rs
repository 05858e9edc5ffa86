//! Product repository for database operations
//!
//! This module provides the ProductRepository struct which encapsulates
//! SeaORM operations for the products table: duplicate-tolerant bulk inserts
//! for the ingestion pipeline and a paged, filterable search for the API.

use anyhow::Result;
use sea_orm::prelude::*;
use sea_orm::sea_query::{Func, OnConflict};
use sea_orm::{
    ColumnTrait, Condition, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::models::Product;
use crate::models::product;

/// Rows per INSERT statement, keeps bind counts below SQLite's limit
const INSERT_CHUNK: usize = 500;

/// Sortable product fields exposed by the search API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    ScrapedAt,
    Title,
    Rating,
    ReviewCount,
    PageNumber,
}

impl SortField {
    fn column(&self) -> product::Column {
        match self {
            SortField::ScrapedAt => product::Column::ScrapedAt,
            SortField::Title => product::Column::Title,
            SortField::Rating => product::Column::Rating,
            SortField::ReviewCount => product::Column::ReviewCount,
            SortField::PageNumber => product::Column::PageNumber,
        }
    }
}

/// Sort direction for the search API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Search parameters for the products listing
#[derive(Debug, Clone)]
pub struct ProductQuery {
    /// Restrict to products of one job
    pub job_id: Option<Uuid>,
    /// Case-insensitive substring match over title and asin
    pub search: Option<String>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    /// 1-based page number
    pub page: u64,
    pub per_page: u64,
}

/// One page of search results with pagination totals
#[derive(Debug)]
pub struct ProductPage {
    pub items: Vec<product::Model>,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u64,
}

/// Repository for product database operations
#[derive(Debug, Clone)]
pub struct ProductRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ProductRepository {
    /// Creates a new ProductRepository instance
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts product rows, skipping any that collide on (job_id, asin).
    ///
    /// Returns the number of rows actually persisted, which is what the
    /// ingestion summary must report when re-ingestion meets existing rows.
    pub async fn bulk_insert(&self, rows: Vec<product::ActiveModel>) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK) {
            inserted += Product::insert_many(chunk.to_vec())
                .on_conflict(
                    OnConflict::columns([product::Column::JobId, product::Column::Asin])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;
        }
        Ok(inserted)
    }

    /// Paged product search with optional job filter and free-text matching
    /// over title/asin.
    pub async fn search(&self, query: ProductQuery) -> Result<ProductPage> {
        let mut select = Product::find();

        if let Some(job_id) = query.job_id {
            select = select.filter(product::Column::JobId.eq(job_id));
        }

        if let Some(term) = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            // lower() keeps matching case-insensitive on both backends
            let pattern = format!("%{}%", term.to_lowercase());
            select = select.filter(
                Condition::any()
                    .add(
                        Expr::expr(Func::lower(Expr::col((
                            product::Entity,
                            product::Column::Title,
                        ))))
                        .like(pattern.clone()),
                    )
                    .add(
                        Expr::expr(Func::lower(Expr::col((
                            product::Entity,
                            product::Column::Asin,
                        ))))
                        .like(pattern),
                    ),
            );
        }

        let select = match query.sort_order {
            SortOrder::Asc => select.order_by_asc(query.sort_by.column()),
            SortOrder::Desc => select.order_by_desc(query.sort_by.column()),
        }
        // Stable tie-break so pages never overlap
        .order_by_asc(product::Column::Id);

        let paginator = select.paginate(&*self.db, query.per_page);
        let totals = paginator.num_items_and_pages().await?;
        let items = paginator.fetch_page(query.page.saturating_sub(1)).await?;

        Ok(ProductPage {
            items,
            total: totals.number_of_items,
            total_pages: totals.number_of_pages,
            current_page: query.page,
        })
    }
}
