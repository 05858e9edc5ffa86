//! # Products API Handlers
//!
//! This module contains the paged product search endpoint over everything
//! the ingestion pipeline has persisted.

use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{ApiError, validation_error};
use crate::models::product;
use crate::repositories::{ProductQuery, ProductRepository, SortField, SortOrder};
use crate::server::AppState;

const DEFAULT_PAGE_SIZE: u64 = 20;
const MAX_PAGE_SIZE: u64 = 100;

/// Raw query parameters for the product listing; validated by the handler
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListProductsQuery {
    pub job_id: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub page: Option<String>,
    pub limit: Option<String>,
}

/// One scraped product as stored
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    /// Job that scraped this product
    pub job_id: String,
    #[schema(example = "B0ABC12345")]
    pub asin: String,
    #[schema(example = "Wireless Mouse with USB Receiver")]
    pub title: String,
    /// Normalized price, digits and decimal point only
    #[schema(example = "1299.99")]
    pub price: Option<String>,
    pub original_price: Option<String>,
    #[schema(example = 4.3)]
    pub rating: Option<f64>,
    pub review_count: Option<i32>,
    pub image_url: Option<String>,
    pub product_url: Option<String>,
    pub best_seller: bool,
    pub delivery_info: Option<String>,
    pub page_number: i32,
    pub scraped_at: String,
    pub created_at: String,
}

impl From<product::Model> for ProductRecord {
    fn from(model: product::Model) -> Self {
        Self {
            id: model.id.to_string(),
            job_id: model.job_id.to_string(),
            asin: model.asin,
            title: model.title,
            price: model.price,
            original_price: model.original_price,
            rating: model.rating,
            review_count: model.review_count,
            image_url: model.image_url,
            product_url: model.product_url,
            best_seller: model.best_seller,
            delivery_info: model.delivery_info,
            page_number: model.page_number,
            scraped_at: model.scraped_at.to_rfc3339(),
            created_at: model.created_at.to_rfc3339(),
        }
    }
}

/// One page of products with pagination totals
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductsResponse {
    pub items: Vec<ProductRecord>,
    pub total: u64,
    pub total_pages: u64,
    pub current_page: u64,
}

/// Search scraped products with paging, sorting and filtering
#[utoipa::path(
    get,
    path = "/api/products",
    params(
        ("jobId" = Option<String>, Query, description = "Restrict to products of one job"),
        ("search" = Option<String>, Query, description = "Case-insensitive match over title and ASIN"),
        ("sortBy" = Option<String>, Query, description = "scrapedAt, title, rating, reviewCount or pageNumber"),
        ("sortOrder" = Option<String>, Query, description = "asc or desc"),
        ("page" = Option<u64>, Query, description = "1-based page number"),
        ("limit" = Option<u64>, Query, description = "Page size, between 1 and 100")
    ),
    responses(
        (status = 200, description = "One page of products", body = ProductsResponse),
        (status = 400, description = "Invalid query parameter", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "products"
)]
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<ListProductsQuery>,
) -> Result<Json<ProductsResponse>, ApiError> {
    let job_id = match query
        .job_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| {
            validation_error("Invalid jobId", json!({"jobId": "Must be a valid UUID"}))
        })?),
        None => None,
    };

    let sort_by = match query.sort_by.as_deref() {
        None | Some("scrapedAt") => SortField::ScrapedAt,
        Some("title") => SortField::Title,
        Some("rating") => SortField::Rating,
        Some("reviewCount") => SortField::ReviewCount,
        Some("pageNumber") => SortField::PageNumber,
        Some(_) => {
            return Err(validation_error(
                "Invalid sortBy",
                json!({"sortBy": "Must be one of: scrapedAt, title, rating, reviewCount, pageNumber"}),
            ));
        }
    };

    let sort_order = match query.sort_order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(_) => {
            return Err(validation_error(
                "Invalid sortOrder",
                json!({"sortOrder": "Must be 'asc' or 'desc'"}),
            ));
        }
    };

    let page = match query.page.as_deref() {
        None => 1,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) if n >= 1 => n,
            _ => {
                return Err(validation_error(
                    "Invalid page",
                    json!({"page": "Must be a positive integer"}),
                ));
            }
        },
    };

    let per_page = match query.limit.as_deref() {
        None => DEFAULT_PAGE_SIZE,
        Some(raw) => match raw.parse::<u64>() {
            Ok(n) if (1..=MAX_PAGE_SIZE).contains(&n) => n,
            _ => {
                return Err(validation_error(
                    "Invalid limit",
                    json!({"limit": "Must be an integer between 1 and 100"}),
                ));
            }
        },
    };

    let repo = ProductRepository::new(state.db.clone());
    let page = repo
        .search(ProductQuery {
            job_id,
            search: query.search,
            sort_by,
            sort_order,
            page,
            per_page,
        })
        .await?;

    Ok(Json(ProductsResponse {
        items: page.items.into_iter().map(ProductRecord::from).collect(),
        total: page.total,
        total_pages: page.total_pages,
        current_page: page.current_page,
    }))
}
