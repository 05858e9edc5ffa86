//! Product entity model
//!
//! One row per scraped product accepted by the ingestion pipeline. The
//! (job_id, asin) pair is unique so re-ingesting a result file never produces
//! duplicates.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "products")]
pub struct Model {
    /// Unique identifier for the product row (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Job whose ingestion produced this row
    pub job_id: Uuid,

    /// Marketplace product identifier, required
    pub asin: String,

    /// Product title, required
    pub title: String,

    /// Normalized price, digits and decimal point only
    pub price: Option<String>,

    /// Normalized pre-discount price when present
    pub original_price: Option<String>,

    /// Star rating parsed from the leading float of the raw field
    pub rating: Option<f64>,

    /// Review count with thousands separators stripped
    pub review_count: Option<i32>,

    pub image_url: Option<String>,

    pub product_url: Option<String>,

    /// Whether the listing carried a best-seller badge
    pub best_seller: bool,

    pub delivery_info: Option<String>,

    /// Result page the row was scraped from
    pub page_number: i32,

    /// Timestamp the worker recorded for the row
    pub scraped_at: DateTimeWithTimeZone,

    /// Timestamp when the row was persisted
    pub created_at: DateTimeWithTimeZone,
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
