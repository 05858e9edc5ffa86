//! # Result Ingestion Pipeline
//!
//! Runs once per job after its worker exits cleanly: locates the worker's
//! CSV output, normalizes rows into product records, bulk-persists them
//! tolerating duplicates, and finalizes the job with summary aggregates.
//! A missing file is not an error (zero products is a valid outcome); a
//! malformed row is skipped and logged without aborting the rest of the
//! file.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use metrics::{counter, histogram};
use sea_orm::Set;
use sea_orm::prelude::DateTimeWithTimeZone;
use tokio::task;
use tokio::time::Instant;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::models::job::ResultsSummary;
use crate::models::job_log::LogSource;
use crate::models::product;
use crate::repositories::{JobRepository, ProductRepository, TransitionOutcome};

/// What one ingestion run did.
#[derive(Debug)]
pub struct IngestionOutcome {
    /// Aggregates recorded on the job (when finalization applied)
    pub summary: ResultsSummary,
    /// Rows that passed the success filter and carried asin + title
    pub accepted: u64,
    /// Rows actually persisted; lower than `accepted` on re-ingestion
    pub inserted: u64,
    /// Malformed rows skipped
    pub skipped: u64,
    /// False when another writer finished the job first
    pub finalized: bool,
}

/// One normalized CSV row ready for persistence.
#[derive(Debug, PartialEq)]
struct ParsedRow {
    asin: String,
    title: String,
    price: Option<String>,
    original_price: Option<String>,
    rating: Option<f64>,
    review_count: Option<i32>,
    image_url: Option<String>,
    product_url: Option<String>,
    best_seller: bool,
    delivery_info: Option<String>,
    page_number: i32,
    scraped_at: Option<DateTimeWithTimeZone>,
}

#[derive(Debug, Default)]
struct ParsedFile {
    rows: Vec<ParsedRow>,
    skipped: u64,
    skip_notes: Vec<String>,
}

/// Column indexes resolved from the header row.
#[derive(Debug, Default)]
struct HeaderMap {
    asin: Option<usize>,
    title: Option<usize>,
    price: Option<usize>,
    original_price: Option<usize>,
    rating: Option<usize>,
    review_count: Option<usize>,
    image_url: Option<usize>,
    product_url: Option<usize>,
    best_seller: Option<usize>,
    delivery_info: Option<usize>,
    page_number: Option<usize>,
    scraped_at: Option<usize>,
    success: Option<usize>,
}

impl HeaderMap {
    /// Resolves canonical fields from the accepted header spellings.
    ///
    /// Headers are compared after lower-casing and separator normalization.
    /// For each field the variant list is tried in order and the first
    /// spelling present in the file wins, so a file carrying both `price`
    /// and `current_price` reads from `price`.
    fn locate(headers: &csv::StringRecord) -> Self {
        let normalized: Vec<String> = headers.iter().map(normalize_header).collect();
        let find = |variants: &[&str]| -> Option<usize> {
            variants
                .iter()
                .find_map(|v| normalized.iter().position(|h| h == v))
        };

        Self {
            asin: find(&["asin"]),
            title: find(&["title", "product_title", "product_name", "name"]),
            price: find(&["price", "current_price"]),
            original_price: find(&["original_price", "list_price"]),
            rating: find(&["rating", "stars"]),
            review_count: find(&["review_count", "reviews", "ratings_count"]),
            image_url: find(&["image_url", "image"]),
            product_url: find(&["product_url", "url", "link"]),
            best_seller: find(&["best_seller", "bestseller"]),
            delivery_info: find(&["delivery_info", "delivery"]),
            page_number: find(&["page_number", "page"]),
            scraped_at: find(&["timestamp", "scraped_at"]),
            success: find(&["scraped_successfully", "success"]),
        }
    }
}

/// Runs the full ingestion for one job and finalizes its record.
///
/// Returns an error only for failures beyond per-row tolerance (unreadable
/// file, unusable header, store failure); the caller transitions the job to
/// `failed` in that case so it can never stay stuck in `running`.
#[instrument(skip(jobs, products, config), fields(job_id = %job_id))]
pub async fn run_ingestion(
    jobs: &JobRepository,
    products: &ProductRepository,
    config: &AppConfig,
    job_id: Uuid,
    product_name: &str,
) -> Result<IngestionOutcome> {
    let started = Instant::now();
    let file_name = format!("{}.csv", safe_output_filename(product_name));
    let path = Path::new(&config.worker.output_dir)
        .join("csv")
        .join(&file_name);
    let file_present = path.exists();

    let parsed = if file_present {
        let parse_path = path.clone();
        task::spawn_blocking(move || parse_result_file(&parse_path))
            .await
            .context("result file parser task failed")??
    } else {
        jobs.append_log(
            job_id,
            LogSource::System,
            &format!(
                "Result file not found at {}, recording zero products",
                path.display()
            ),
        )
        .await?;
        ParsedFile::default()
    };

    let ParsedFile {
        rows,
        skipped,
        skip_notes,
    } = parsed;
    for note in &skip_notes {
        jobs.append_log(job_id, LogSource::System, note).await?;
    }

    let accepted = rows.len() as u64;
    let pages_processed = rows
        .iter()
        .map(|r| r.page_number)
        .max()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);

    let now: DateTimeWithTimeZone = Utc::now().into();
    let models: Vec<product::ActiveModel> = rows
        .into_iter()
        .map(|row| product::ActiveModel {
            id: Set(Uuid::new_v4()),
            job_id: Set(job_id),
            asin: Set(row.asin),
            title: Set(row.title),
            price: Set(row.price),
            original_price: Set(row.original_price),
            rating: Set(row.rating),
            review_count: Set(row.review_count),
            image_url: Set(row.image_url),
            product_url: Set(row.product_url),
            best_seller: Set(row.best_seller),
            delivery_info: Set(row.delivery_info),
            page_number: Set(row.page_number),
            scraped_at: Set(row.scraped_at.unwrap_or(now)),
            created_at: Set(now),
        })
        .collect();

    let inserted = products.bulk_insert(models).await?;
    counter!("ingest_rows_accepted_total").increment(accepted);
    counter!("ingest_rows_skipped_total").increment(skipped);
    if inserted < accepted {
        info!(
            job_id = %job_id,
            accepted,
            inserted,
            "Some accepted rows were already present and were skipped"
        );
    }

    let summary = ResultsSummary {
        total_scraped: inserted,
        pages_processed,
        output_files: if file_present {
            vec![format!("csv/{}", file_name)]
        } else {
            Vec::new()
        },
    };

    let (finalized, line) = match jobs.finalize_completed(job_id, &summary).await? {
        TransitionOutcome::Applied(_) => (
            true,
            format!(
                "Ingestion complete: {} products persisted ({} rows accepted, {} skipped) across {} pages",
                inserted, accepted, skipped, pages_processed
            ),
        ),
        TransitionOutcome::Rejected { current } => {
            warn!(job_id = %job_id, current = %current, "Job finished elsewhere, ingestion summary not recorded");
            (
                false,
                format!(
                    "Ingestion finished after job reached status '{}', summary not recorded",
                    current
                ),
            )
        }
        TransitionOutcome::NotFound => {
            bail!("job {} disappeared during result ingestion", job_id)
        }
    };
    jobs.append_log(job_id, LogSource::System, &line).await?;
    histogram!("ingest_duration_seconds").record(started.elapsed().as_secs_f64());

    Ok(IngestionOutcome {
        summary,
        accepted,
        inserted,
        skipped,
        finalized,
    })
}

/// Derives the worker's output file stem from the product name.
///
/// Spaces become underscores before lower-casing; anything that is not a
/// word character or hyphen is dropped. The worker derives its file name
/// the same way, which is the contract that lets the pipeline find the
/// file.
pub fn safe_output_filename(product_name: &str) -> String {
    product_name
        .trim()
        .replace(' ', "_")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Streams the CSV, normalizing accepted rows and noting skipped ones.
fn parse_result_file(path: &Path) -> Result<ParsedFile> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open result file {}", path.display()))?;

    let headers = reader
        .headers()
        .context("failed to read result file header")?
        .clone();
    let columns = HeaderMap::locate(&headers);
    if columns.asin.is_none() && columns.title.is_none() {
        bail!(
            "result file {} has no recognizable asin/title columns",
            path.display()
        );
    }

    let mut parsed = ParsedFile::default();

    for (index, record) in reader.records().enumerate() {
        // Header occupies line 1
        let line_no = index + 2;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                parsed.skipped += 1;
                parsed
                    .skip_notes
                    .push(format!("Skipping unreadable row at line {}: {}", line_no, err));
                continue;
            }
        };

        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i));

        // Rows the worker itself marked unsuccessful are filtered, not
        // skipped-as-malformed. A file without the column accepts all rows.
        if let Some(success) = field(columns.success)
            && !is_truthy(success)
        {
            continue;
        }

        let asin = field(columns.asin).unwrap_or("").trim();
        let title = field(columns.title).unwrap_or("").trim();
        if asin.is_empty() || title.is_empty() {
            parsed.skipped += 1;
            parsed
                .skip_notes
                .push(format!("Skipping row at line {}: missing asin or title", line_no));
            continue;
        }

        parsed.rows.push(ParsedRow {
            asin: asin.to_string(),
            title: title.to_string(),
            price: field(columns.price).and_then(normalize_money),
            original_price: field(columns.original_price).and_then(normalize_money),
            rating: field(columns.rating).and_then(parse_rating),
            review_count: field(columns.review_count).and_then(parse_review_count),
            image_url: opt_string(field(columns.image_url)),
            product_url: opt_string(field(columns.product_url)),
            best_seller: field(columns.best_seller).is_some_and(is_truthy),
            delivery_info: opt_string(field(columns.delivery_info)),
            page_number: parse_page_number(field(columns.page_number)),
            scraped_at: field(columns.scraped_at).and_then(parse_timestamp),
        });
    }

    Ok(parsed)
}

fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '-'], "_")
}

/// Accepts the success-flag encodings workers actually emit.
fn is_truthy(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "yes" | "1" | "true")
}

/// Strips currency symbols and thousands separators, keeping digits and the
/// decimal point.
fn normalize_money(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned
        .chars()
        .any(|c| c.is_ascii_digit())
        .then_some(cleaned)
}

/// Parses the leading float of a rating field such as "4.3 out of 5 stars".
fn parse_rating(raw: &str) -> Option<f64> {
    let numeric: String = raw
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    numeric.parse().ok()
}

fn parse_review_count(raw: &str) -> Option<i32> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Missing or unparsable page numbers default to page 1.
fn parse_page_number(raw: Option<&str>) -> i32 {
    raw.and_then(|r| r.trim().parse::<i32>().ok())
        .map(|n| n.max(1))
        .unwrap_or(1)
}

/// Source-provided timestamps in the worker's format or ISO 8601; anything
/// else falls back to ingestion time at the call site.
fn parse_timestamp(raw: &str) -> Option<DateTimeWithTimeZone> {
    let trimmed = raw.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Some(Utc.from_utc_datetime(&naive).into());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive).into());
    }
    DateTime::parse_from_rfc3339(trimmed).ok()
}

fn opt_string(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
