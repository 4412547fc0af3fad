//! Listing report rendering (Askama) and a read-only Axum viewer over stored
//! runs.

use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use rels_core::{Listing, INPUT_KEY, OUTPUT_KEY, REPORT_KEY};
use rels_storage::RunStore;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rels-web";

const RUN_INDEX_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("report template failed: {0}")]
    Template(#[from] askama::Error),
}

#[derive(Debug, Clone)]
struct ListingCard {
    detail_url: String,
    has_image: bool,
    img_src: String,
    address: String,
    price: String,
    bedrooms: String,
    bathrooms: String,
    area: String,
    home_type: String,
    match_reason: String,
}

impl From<&Listing> for ListingCard {
    fn from(listing: &Listing) -> Self {
        let bedrooms = match listing.bedrooms {
            0 => "Studio".to_string(),
            n => format!("{n} Beds"),
        };
        Self {
            detail_url: listing.detail_url.clone(),
            has_image: listing.img_src.is_some(),
            img_src: listing.img_src.clone().unwrap_or_default(),
            address: listing.address.clone(),
            price: listing.price.clone(),
            bedrooms,
            bathrooms: format!("{} Baths", listing.bathrooms),
            area: format!("{} sqft", listing.area),
            home_type: listing.home_type.clone(),
            match_reason: listing.match_reason.clone(),
        }
    }
}

#[derive(Template)]
#[template(path = "report.html")]
struct ReportTemplate {
    cards: Vec<ListingCard>,
}

/// Render the listing set as a single whitespace-collapsed HTML document,
/// one card per listing in the given order.
pub fn render_report(listings: &[Listing]) -> Result<String, RenderError> {
    let html = ReportTemplate {
        cards: listings.iter().map(ListingCard::from).collect(),
    }
    .render()?;
    Ok(html.split_whitespace().collect::<Vec<_>>().join(" "))
}

#[derive(Clone)]
pub struct AppState {
    pub store: RunStore,
}

impl AppState {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: RunStore::new(runs_dir),
        }
    }
}

#[derive(Debug, Clone)]
struct RunRow {
    run_id: String,
    request: String,
    outcome: String,
    failed: bool,
    has_report: bool,
}

#[derive(Template)]
#[template(path = "runs.html")]
struct RunsTemplate {
    runs: Vec<RunRow>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/runs/{run_id}/report", get(report_handler))
        .route("/runs/{run_id}/output", get(output_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, runs_dir = %state.store.root().display(), "serving run viewer");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RELS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let runs_dir = std::env::var("RELS_RUNS_DIR").unwrap_or_else(|_| "./runs".to_string());
    serve(AppState::new(runs_dir), port).await
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_runs(&state.store, RUN_INDEX_LIMIT).await {
        Ok(runs) => render_html(RunsTemplate { runs }),
        Err(err) => server_error(err),
    }
}

async fn report_handler(State(state): State<Arc<AppState>>, AxumPath(run_id): AxumPath<String>) -> Response {
    match read_slot(&state.store, &run_id, REPORT_KEY, "text/html").await {
        Ok(Some(bytes)) => Html(String::from_utf8_lossy(&bytes).into_owned()).into_response(),
        Ok(None) => not_found("report"),
        Err(err) => server_error(err),
    }
}

async fn output_handler(State(state): State<Arc<AppState>>, AxumPath(run_id): AxumPath<String>) -> Response {
    match read_slot(&state.store, &run_id, OUTPUT_KEY, "application/json").await {
        Ok(Some(bytes)) => ([(header::CONTENT_TYPE, "application/json")], bytes).into_response(),
        Ok(None) => not_found("output"),
        Err(err) => server_error(err),
    }
}

/// Run ids are UUIDs; anything else is treated as an unknown run.
async fn read_slot(
    store: &RunStore,
    run_id: &str,
    key: &str,
    content_type: &str,
) -> anyhow::Result<Option<Vec<u8>>> {
    if Uuid::parse_str(run_id).is_err() {
        return Ok(None);
    }
    store.get_value(run_id, key, content_type).await
}

async fn load_runs(store: &RunStore, limit: usize) -> anyhow::Result<Vec<RunRow>> {
    let mut rows = Vec::new();
    for entry in store.list_runs(limit)? {
        let request = store
            .get_value(&entry.run_id, INPUT_KEY, "application/json")
            .await?
            .and_then(|bytes| serde_json::from_slice::<JsonValue>(&bytes).ok())
            .and_then(|v| v.get("realEstateRequest").and_then(|r| r.as_str()).map(ToString::to_string))
            .unwrap_or_default();
        let output = store
            .get_value(&entry.run_id, OUTPUT_KEY, "application/json")
            .await?
            .and_then(|bytes| serde_json::from_slice::<JsonValue>(&bytes).ok());
        let (outcome, failed) = match output {
            Some(value) => match value.get("listings").and_then(|l| l.as_array()) {
                Some(listings) => (format!("{} listings", listings.len()), false),
                None => (
                    format!(
                        "failed ({})",
                        value.get("kind").and_then(|k| k.as_str()).unwrap_or("unknown")
                    ),
                    true,
                ),
            },
            None => ("in progress".to_string(), false),
        };
        let has_report = store
            .get_value(&entry.run_id, REPORT_KEY, "text/html")
            .await?
            .is_some();
        rows.push(RunRow {
            run_id: entry.run_id,
            request,
            outcome,
            failed,
            has_report,
        });
    }
    Ok(rows)
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Html(format!("No {what} for that run"))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}
