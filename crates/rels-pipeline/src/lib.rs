//! Search pipeline orchestration: parameter derivation, retrieval, filtering,
//! normalization, rendering and run-slot storage.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rels_adapters::{
    candidates_from_raw, ApifyActorSource, FixtureListingSource, ListingSource, OpenAiChatClient, Payload,
    ReasoningClient, ResponseNormalizer, RetrievalError, DEFAULT_ACTOR_ID, DEFAULT_APIFY_BASE_URL,
    DEFAULT_MODEL, DEFAULT_OPENAI_BASE_URL,
};
use rels_core::{
    CandidateListing, ErrorRecord, Listing, ListingOutput, QueryParameters, SchemaError, SearchRequest,
    INPUT_KEY, OUTPUT_KEY, REPORT_KEY, USAGE_KEY,
};
use rels_storage::{slot_file_name, HttpClientConfig, JsonHttpClient, RunStore};
use rels_web::{render_report, RenderError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod cues;
pub mod derive;
pub mod policy;

pub use derive::{
    DerivationError, KeywordParameterDeriver, ReasoningParameterDeriver, RequestCues, SearchParameterDeriver,
};
pub use policy::{
    FilterBranch, FilterPolicy, KeywordFilterPolicy, PolicyError, ReasoningFilterPolicy, RequirementSet,
    CLOSE_MATCH_REASON, FALLBACK_CAP, SEARCH_AREA_REASON,
};

pub const CRATE_NAME: &str = "rels-pipeline";

/// Retrieved records beyond this count never reach the filter.
pub const MAX_CANDIDATES: usize = 20;

pub const WRAPPER_KEYS_RULES: &str = "rules/wrapper_keys.yaml";

pub const USAGE_INIT: &str = "init";
pub const USAGE_LLM_INPUT: &str = "llm-input";
pub const USAGE_LISTINGS_OUTPUT: &str = "listings-output";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub runs_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub model: String,
    pub apify_token: Option<String>,
    pub apify_base_url: String,
    pub actor_id: String,
    pub listings_fixture: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub run_budget_secs: u64,
    pub user_agent: String,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            runs_dir: env_nonempty("RELS_RUNS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./runs")),
            workspace_root: env_nonempty("RELS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            openai_api_key: env_nonempty("OPENAI_API_KEY"),
            openai_base_url: env_nonempty("RELS_OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            model: env_nonempty("RELS_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            apify_token: env_nonempty("APIFY_TOKEN"),
            apify_base_url: env_nonempty("RELS_APIFY_BASE_URL")
                .unwrap_or_else(|| DEFAULT_APIFY_BASE_URL.to_string()),
            actor_id: env_nonempty("RELS_ACTOR_ID").unwrap_or_else(|| DEFAULT_ACTOR_ID.to_string()),
            listings_fixture: env_nonempty("RELS_LISTINGS_FIXTURE").map(PathBuf::from),
            http_timeout_secs: std::env::var("RELS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(120),
            run_budget_secs: std::env::var("RELS_RUN_BUDGET_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            user_agent: env_nonempty("RELS_USER_AGENT").unwrap_or_else(|| "rels-bot/0.1".to_string()),
        }
    }

    pub fn run_budget(&self) -> Duration {
        Duration::from_secs(self.run_budget_secs)
    }

    pub fn http_client(&self) -> Result<JsonHttpClient> {
        JsonHttpClient::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        })
    }

    /// Fixture file when configured, otherwise the hosted search actor.
    pub fn listing_source(&self, http: &JsonHttpClient) -> Result<Arc<dyn ListingSource>> {
        if let Some(path) = &self.listings_fixture {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                self.workspace_root.join(path)
            };
            return Ok(Arc::new(FixtureListingSource::new(path)));
        }
        let token = self
            .apify_token
            .as_deref()
            .context("no listing source configured: set APIFY_TOKEN or RELS_LISTINGS_FIXTURE")?;
        Ok(Arc::new(ApifyActorSource::new(
            http.clone(),
            &self.apify_base_url,
            &self.actor_id,
            token,
        )))
    }

    /// Wrapper keys from `rules/wrapper_keys.yaml` when present, otherwise the
    /// built-in list.
    pub fn normalizer(&self) -> Result<ResponseNormalizer> {
        let path = self.workspace_root.join(WRAPPER_KEYS_RULES);
        if path.exists() {
            ResponseNormalizer::from_rules_file(&path)
        } else {
            Ok(ResponseNormalizer::default())
        }
    }
}

/// Where the reasoning-service credential for one invocation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Override(String),
    Environment(String),
    Missing,
}

impl Credential {
    pub fn key(&self) -> Option<&str> {
        match self {
            Credential::Override(key) | Credential::Environment(key) => Some(key.as_str()),
            Credential::Missing => None,
        }
    }
}

pub fn resolve_credential(request: &SearchRequest, env_key: Option<&str>) -> Credential {
    if let Some(key) = request.credential_override() {
        return Credential::Override(key.to_string());
    }
    match env_key.map(str::trim).filter(|k| !k.is_empty()) {
        Some(key) => Credential::Environment(key.to_string()),
        None => Credential::Missing,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event: String,
    pub count: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLedger {
    pub events: Vec<UsageEvent>,
}

impl UsageLedger {
    pub fn record(&mut self, event: &str, count: u64) {
        self.events.push(UsageEvent {
            event: event.to_string(),
            count,
            recorded_at: Utc::now(),
        });
    }

    pub fn count_for(&self, event: &str) -> Option<u64> {
        self.events.iter().find(|e| e.event == event).map(|e| e.count)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Input(#[source] SchemaError),
    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),
    #[error("could not derive search parameters: {0}")]
    Derivation(#[from] DerivationError),
    #[error("listing retrieval failed: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("filtering failed: {0}")]
    Policy(#[from] PolicyError),
    #[error("report rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("run exceeded its {}s budget", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Input(_) => "input",
            PipelineError::Config(_) => "config",
            PipelineError::Derivation(_) => "derivation",
            PipelineError::Retrieval(_) => "retrieval",
            PipelineError::Policy(_) => "policy",
            PipelineError::Render(_) => "render",
            PipelineError::Timeout(_) => "timeout",
            PipelineError::Storage(_) => "storage",
        }
    }

    pub fn to_error_record(&self) -> ErrorRecord {
        ErrorRecord {
            error: self.to_string(),
            kind: self.kind().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub run_dir: String,
    pub status: RunStatus,
    pub query: Option<QueryParameters>,
    pub retrieved: usize,
    pub considered: usize,
    pub listings: usize,
    pub dropped: usize,
    pub error: Option<ErrorRecord>,
    pub usage: UsageLedger,
}

#[derive(Debug, Clone)]
struct SearchOutcome {
    query: QueryParameters,
    retrieved: usize,
    considered: usize,
    listings: Vec<Listing>,
    dropped: usize,
    html: String,
}

pub struct SearchPipeline {
    store: RunStore,
    source: Arc<dyn ListingSource>,
    deriver: Box<dyn SearchParameterDeriver>,
    policy: Box<dyn FilterPolicy>,
    normalizer: ResponseNormalizer,
    run_budget: Duration,
}

impl SearchPipeline {
    /// Offline keyword strategy with default normalizer and budget.
    pub fn new(store: RunStore, source: Arc<dyn ListingSource>) -> Self {
        Self {
            store,
            source,
            deriver: Box::<KeywordParameterDeriver>::default(),
            policy: Box::<KeywordFilterPolicy>::default(),
            normalizer: ResponseNormalizer::default(),
            run_budget: Duration::from_secs(300),
        }
    }

    pub fn with_strategy(
        mut self,
        deriver: Box<dyn SearchParameterDeriver>,
        policy: Box<dyn FilterPolicy>,
    ) -> Self {
        self.deriver = deriver;
        self.policy = policy;
        self
    }

    pub fn with_normalizer(mut self, normalizer: ResponseNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn with_run_budget(mut self, run_budget: Duration) -> Self {
        self.run_budget = run_budget;
        self
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Run one invocation. Input errors return before anything is stored or
    /// fetched; later failures become the error record in the output slot.
    pub async fn run(&self, request: SearchRequest, credential: &Credential) -> Result<SearchRunSummary, PipelineError> {
        let request = request.validated().map_err(PipelineError::Input)?;
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "search_run",
            %run_id,
            deriver = self.deriver.name(),
            policy = self.policy.name(),
            source = self.source.source_id()
        );
        self.run_validated(run_id, request, credential).instrument(span).await
    }

    async fn run_validated(
        &self,
        run_id: Uuid,
        request: SearchRequest,
        credential: &Credential,
    ) -> Result<SearchRunSummary, PipelineError> {
        let started_at = Utc::now();
        let mut usage = UsageLedger::default();
        usage.record(USAGE_INIT, 1);
        if let Credential::Environment(_) = credential {
            usage.record(USAGE_LLM_INPUT, request.request.chars().count() as u64);
        }

        let mut records = vec![self.store.set_json(run_id, INPUT_KEY, &request.redacted()).await?];

        let outcome = match tokio::time::timeout(self.run_budget, self.process(&request.request)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout(self.run_budget)),
        };

        let mut summary = SearchRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            run_dir: self.store.run_dir(run_id).display().to_string(),
            status: RunStatus::Succeeded,
            query: None,
            retrieved: 0,
            considered: 0,
            listings: 0,
            dropped: 0,
            error: None,
            usage: UsageLedger::default(),
        };

        match outcome {
            Ok(outcome) => {
                let output = ListingOutput {
                    listings: outcome.listings,
                };
                records.push(self.store.set_json(run_id, OUTPUT_KEY, &output).await?);
                records.push(
                    self.store
                        .set_value(run_id, REPORT_KEY, "text/html", outcome.html.as_bytes())
                        .await?,
                );
                usage.record(USAGE_LISTINGS_OUTPUT, output.listings.len() as u64);
                info!(listings = output.listings.len(), dropped = outcome.dropped, "search run succeeded");

                summary.query = Some(outcome.query);
                summary.retrieved = outcome.retrieved;
                summary.considered = outcome.considered;
                summary.listings = output.listings.len();
                summary.dropped = outcome.dropped;
            }
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "search run failed");
                let record = err.to_error_record();
                records.push(self.store.set_json(run_id, OUTPUT_KEY, &record).await?);
                summary.status = RunStatus::Failed;
                summary.error = Some(record);
            }
        }

        records.push(self.store.set_json(run_id, USAGE_KEY, &usage).await?);
        self.store.write_manifest(run_id, &records).await?;

        summary.finished_at = Utc::now();
        summary.usage = usage;
        Ok(summary)
    }

    async fn process(&self, request: &str) -> Result<SearchOutcome, PipelineError> {
        let query = self.deriver.derive(request).await?;
        info!(
            zip_codes = ?query.zip_codes,
            for_rent = query.for_rent,
            price_min = ?query.price_min,
            price_max = ?query.price_max,
            "derived query parameters"
        );

        let raw = self.fetch_with_retry(&query).await?;
        let retrieved = raw.len();
        if retrieved > MAX_CANDIDATES {
            info!(retrieved, kept = MAX_CANDIDATES, "truncating retrieved listings");
        }
        let mapped = candidates_from_raw(&raw[..retrieved.min(MAX_CANDIDATES)], self.source.site_base());
        let (candidates, incomplete) = split_complete(mapped);
        if incomplete > 0 {
            warn!(incomplete, "skipping retrieved records that lack required listing fields");
        }

        let payload = if candidates.is_empty() {
            Payload::Structured(JsonValue::Array(Vec::new()))
        } else {
            self.policy.apply(request, &candidates).await?
        };
        let normalized = self.normalizer.normalize(payload);
        if normalized.dropped > 0 {
            warn!(dropped = normalized.dropped, "filtered payload carried invalid records");
        }

        let listings = restore_retrieval_order(normalized.listings, &candidates);
        let html = render_report(&listings)?;

        Ok(SearchOutcome {
            query,
            retrieved,
            considered: candidates.len(),
            listings,
            dropped: incomplete + normalized.dropped,
            html,
        })
    }

    /// One extra attempt on an explicit source error; an empty result is a
    /// valid answer and is never retried.
    async fn fetch_with_retry(&self, query: &QueryParameters) -> Result<Vec<JsonValue>, RetrievalError> {
        match self.source.fetch_listings(query).await {
            Ok(records) => Ok(records),
            Err(first) => {
                warn!(source = self.source.source_id(), error = %first, "retrieval failed; retrying once");
                self.source.fetch_listings(query).await
            }
        }
    }
}

/// Keep candidates whose mapped fields already satisfy the listing schema;
/// the rest are counted so fallbacks only pick listings that can be output.
fn split_complete(mapped: Vec<CandidateListing>) -> (Vec<CandidateListing>, usize) {
    let total = mapped.len();
    let complete: Vec<_> = mapped
        .into_iter()
        .filter(|c| match c.check_listing_fields() {
            Ok(()) => true,
            Err(err) => {
                debug!(id = c.id.as_str(), error = %err, "incomplete candidate");
                false
            }
        })
        .collect();
    let incomplete = total - complete.len();
    (complete, incomplete)
}

/// Put filtered listings back in retrieval order, dropping duplicates and
/// ids that were never retrieved.
pub fn restore_retrieval_order(listings: Vec<Listing>, candidates: &[CandidateListing]) -> Vec<Listing> {
    let mut seen = HashSet::new();
    let mut positioned = listings
        .into_iter()
        .filter_map(|listing| {
            let Some(pos) = candidates.iter().position(|c| c.id == listing.id) else {
                warn!(id = listing.id.as_str(), "dropping listing that was not retrieved");
                return None;
            };
            seen.insert(listing.id.clone()).then_some((pos, listing))
        })
        .collect::<Vec<_>>();
    positioned.sort_by_key(|(pos, _)| *pos);
    positioned.into_iter().map(|(_, listing)| listing).collect()
}

/// Resolve the credential, pick the strategy and run one search.
pub async fn run_search(config: &PipelineConfig, request: SearchRequest) -> Result<SearchRunSummary, PipelineError> {
    let request = request.validated().map_err(PipelineError::Input)?;
    let credential = resolve_credential(&request, config.openai_api_key.as_deref());

    let http = config.http_client().map_err(PipelineError::Config)?;
    let source = config.listing_source(&http).map_err(PipelineError::Config)?;
    let normalizer = config.normalizer().map_err(PipelineError::Config)?;

    let pipeline = SearchPipeline::new(RunStore::new(config.runs_dir.clone()), source)
        .with_normalizer(normalizer)
        .with_run_budget(config.run_budget());
    let pipeline = match credential.key() {
        Some(key) => {
            let client: Arc<dyn ReasoningClient> = Arc::new(OpenAiChatClient::new(
                http.clone(),
                &config.openai_base_url,
                &config.model,
                key,
            ));
            pipeline.with_strategy(
                Box::new(ReasoningParameterDeriver::new(client.clone())),
                Box::new(ReasoningFilterPolicy::new(client)),
            )
        }
        None => {
            warn!("no reasoning credential available; running in offline keyword mode");
            pipeline
        }
    };

    pipeline.run(request, &credential).await
}

pub async fn run_search_from_env(request: SearchRequest) -> Result<SearchRunSummary, PipelineError> {
    let config = PipelineConfig::from_env();
    run_search(&config, request).await
}

pub fn report_runs_markdown(store: &RunStore, limit: usize) -> Result<String> {
    let runs = store.list_runs(limit.max(1))?;

    let mut lines = vec!["# RELS Recent Runs".to_string(), String::new()];
    if runs.is_empty() {
        lines.push(format!("_no runs under `{}`_", store.root().display()));
    }
    for run in runs {
        lines.push(format!("## Run `{}`", run.run_id));

        let input_path = run.path.join(slot_file_name(INPUT_KEY, "application/json"));
        if let Ok(text) = std::fs::read_to_string(&input_path) {
            let input: SearchRequest =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", input_path.display()))?;
            lines.push(format!("- request: {}", input.request));
        }

        let output_path = run.path.join(slot_file_name(OUTPUT_KEY, "application/json"));
        match std::fs::read_to_string(&output_path) {
            Ok(text) => {
                let value: JsonValue =
                    serde_json::from_str(&text).with_context(|| format!("parsing {}", output_path.display()))?;
                if let Some(listings) = value.get("listings").and_then(|v| v.as_array()) {
                    lines.push(format!("- listings: {}", listings.len()));
                } else {
                    let kind = value.get("kind").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let error = value.get("error").and_then(|v| v.as_str()).unwrap_or_default();
                    lines.push(format!("- failed ({kind}): {error}"));
                }
            }
            Err(_) => lines.push("- output: missing".to_string()),
        }

        let report_path = run.path.join(slot_file_name(REPORT_KEY, "text/html"));
        if report_path.exists() {
            lines.push(format!("- report: `{}`", report_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rels_adapters::ReasoningError;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        replies: Mutex<VecDeque<Result<Vec<JsonValue>, String>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Result<Vec<JsonValue>, String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ListingSource for ScriptedSource {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn fetch_listings(&self, _params: &QueryParameters) -> Result<Vec<JsonValue>, RetrievalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
            reply.map_err(RetrievalError::Upstream)
        }
    }

    struct ScriptedReasoning(String);

    #[async_trait]
    impl ReasoningClient for ScriptedReasoning {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete_json(&self, _system: &str, _user: &str) -> Result<String, ReasoningError> {
            Ok(self.0.clone())
        }
    }

    fn raw_listing(zpid: u64, price: &str, beds: u32, home_type: &str) -> JsonValue {
        json!({
            "zpid": zpid.to_string(),
            "detailUrl": format!("/homedetails/{zpid}_zpid/"),
            "imgSrc": format!("https://photos.example.com/{zpid}.jpg"),
            "price": price,
            "address": format!("{zpid} Palm Dr, Beverly Hills, CA 90210"),
            "beds": beds,
            "baths": 1,
            "area": 850,
            "hdpData": { "homeInfo": { "homeType": home_type } }
        })
    }

    fn scenario_listings() -> Vec<JsonValue> {
        vec![
            raw_listing(1001, "$1,950/mo", 2, "APARTMENT"),
            raw_listing(1002, "$5,000/mo", 4, "SINGLE_FAMILY"),
            raw_listing(1003, "$3,500/mo", 3, "CONDO"),
        ]
    }

    async fn read_output(store: &RunStore, run_id: Uuid) -> JsonValue {
        let bytes = store
            .get_value(&run_id.to_string(), OUTPUT_KEY, "application/json")
            .await
            .unwrap()
            .expect("output slot");
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn apartment_scenario_keeps_the_single_match() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let summary = pipeline
            .run(
                SearchRequest::new("2BR apartment under $2000 in 90210", None),
                &Credential::Missing,
            )
            .await
            .unwrap();

        assert_eq!(summary.status, RunStatus::Succeeded);
        let query = summary.query.clone().unwrap();
        assert_eq!(query.zip_codes, vec!["90210"]);
        assert!(query.for_rent);
        assert_eq!(query.price_max, Some(2000));
        assert_eq!(summary.retrieved, 3);
        assert_eq!(summary.listings, 1);

        let output = read_output(pipeline.store(), summary.run_id).await;
        let listings = output["listings"].as_array().unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0]["id"], "1001");
        assert_eq!(listings[0]["detailUrl"], "https://www.zillow.com/homedetails/1001_zpid/");
        let reason = listings[0]["match_reason"].as_str().unwrap();
        assert!(reason.contains("budget") || reason.contains("bedrooms"), "{reason}");

        let html = pipeline
            .store()
            .get_value(&summary.run_id.to_string(), REPORT_KEY, "text/html")
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(html).unwrap().contains("1001 Palm Dr"));

        assert_eq!(summary.usage.count_for(USAGE_INIT), Some(1));
        assert_eq!(summary.usage.count_for(USAGE_LLM_INPUT), None);
        assert_eq!(summary.usage.count_for(USAGE_LISTINGS_OUTPUT), Some(1));
        assert!(pipeline.store().run_dir(summary.run_id).join("manifest.json").exists());
    }

    #[tokio::test]
    async fn empty_request_fails_before_any_external_call() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let err = pipeline
            .run(SearchRequest::new("   ", None), &Credential::Missing)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Input(_)));
        assert_eq!(source.calls(), 0);
        assert!(pipeline.store().list_runs(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrieval_error_is_retried_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Err("actor crashed".into()), Ok(scenario_listings())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let summary = pipeline
            .run(SearchRequest::new("anything in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(summary.listings, 3);
    }

    #[tokio::test]
    async fn empty_retrieval_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let summary = pipeline
            .run(SearchRequest::new("anything in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(read_output(pipeline.store(), summary.run_id).await, json!({ "listings": [] }));
    }

    #[tokio::test]
    async fn second_retrieval_failure_stores_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Err("down".into()), Err("still down".into())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let summary = pipeline
            .run(SearchRequest::new("anything in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(source.calls(), 2);
        assert_eq!(summary.status, RunStatus::Failed);

        let output = read_output(pipeline.store(), summary.run_id).await;
        assert_eq!(output["kind"], "retrieval");
        assert!(output["error"].as_str().unwrap().contains("still down"));
        assert!(output.get("listings").is_none());
        assert!(pipeline
            .store()
            .get_value(&summary.run_id.to_string(), REPORT_KEY, "text/html")
            .await
            .unwrap()
            .is_none());
    }

    fn without_area(mut raw: JsonValue) -> JsonValue {
        if let Some(obj) = raw.as_object_mut() {
            obj.remove("area");
        }
        raw
    }

    async fn output_ids(store: &RunStore, run_id: Uuid) -> Vec<(String, String)> {
        read_output(store, run_id).await["listings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| {
                (
                    l["id"].as_str().unwrap().to_string(),
                    l["match_reason"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn close_match_fallback_picks_five_complete_listings() {
        let dir = tempfile::tempdir().unwrap();
        let raw = (0..10)
            .map(|i| {
                let listing = raw_listing(3000 + i, "$2,000/mo", 2, "APARTMENT");
                if i < 3 {
                    without_area(listing)
                } else {
                    listing
                }
            })
            .collect();
        let source = ScriptedSource::new(vec![Ok(raw)]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);

        let summary = pipeline
            .run(SearchRequest::new("studio condo under $1000 in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(summary.considered, 7);
        assert_eq!(summary.listings, FALLBACK_CAP);
        assert_eq!(summary.dropped, 3);

        let out = output_ids(pipeline.store(), summary.run_id).await;
        let ids: Vec<_> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["3003", "3004", "3005", "3006", "3007"]);
        assert!(out.iter().all(|(_, reason)| reason == CLOSE_MATCH_REASON));
    }

    #[tokio::test]
    async fn incomplete_match_does_not_hide_the_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = vec![without_area(raw_listing(4000, "$2,000/mo", 2, "APARTMENT"))];
        raw.extend((1..7).map(|i| raw_listing(4000 + i, "$2,000/mo", 3, "APARTMENT")));
        let source = ScriptedSource::new(vec![Ok(raw)]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);

        let summary = pipeline
            .run(SearchRequest::new("2 bed place in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(summary.listings, FALLBACK_CAP);
        assert_eq!(summary.dropped, 1);
        let out = output_ids(pipeline.store(), summary.run_id).await;
        assert_eq!(out[0].0, "4001");
        assert!(out.iter().all(|(_, reason)| reason == CLOSE_MATCH_REASON));
    }

    #[tokio::test]
    async fn matched_and_search_area_branches_skip_incomplete_records() {
        let dir = tempfile::tempdir().unwrap();
        let raw = vec![
            without_area(raw_listing(5000, "$1,900/mo", 2, "APARTMENT")),
            raw_listing(5001, "$1,950/mo", 2, "APARTMENT"),
            raw_listing(5002, "$2,500/mo", 3, "APARTMENT"),
        ];
        let source = ScriptedSource::new(vec![Ok(raw.clone()), Ok(raw)]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);

        let matched = pipeline
            .run(SearchRequest::new("2 bed place in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(matched.listings, 1);
        assert_eq!(matched.dropped, 1);
        assert_eq!(output_ids(pipeline.store(), matched.run_id).await[0].0, "5001");

        let everything = pipeline
            .run(SearchRequest::new("homes in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        let out = output_ids(pipeline.store(), everything.run_id).await;
        let ids: Vec<_> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["5001", "5002"]);
        assert!(out.iter().all(|(_, reason)| reason == SEARCH_AREA_REASON));
        assert_eq!(everything.dropped, 1);
    }

    #[tokio::test]
    async fn only_the_first_twenty_records_reach_the_filter() {
        let dir = tempfile::tempdir().unwrap();
        let many = (0..30).map(|i| raw_listing(2000 + i, "$2,000/mo", 2, "APARTMENT")).collect();
        let source = ScriptedSource::new(vec![Ok(many)]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);

        let summary = pipeline
            .run(SearchRequest::new("homes in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(summary.retrieved, 30);
        assert_eq!(summary.considered, MAX_CANDIDATES);

        let output = read_output(pipeline.store(), summary.run_id).await;
        let listings = output["listings"].as_array().unwrap();
        assert_eq!(listings.len(), 20);
        assert_eq!(listings[0]["id"], "2000");
        assert_eq!(listings[19]["id"], "2019");
        assert!(listings.iter().all(|l| l["match_reason"] == SEARCH_AREA_REASON));
    }

    #[tokio::test]
    async fn unparsable_reasoning_reply_stores_empty_listings() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let client: Arc<dyn ReasoningClient> = Arc::new(ScriptedReasoning("not json".into()));
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source).with_strategy(
            Box::<KeywordParameterDeriver>::default(),
            Box::new(ReasoningFilterPolicy::new(client)),
        );

        let summary = pipeline
            .run(SearchRequest::new("2BR in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Succeeded);
        assert_eq!(read_output(pipeline.store(), summary.run_id).await, json!({ "listings": [] }));
    }

    #[tokio::test]
    async fn reasoning_selection_is_put_back_in_retrieval_order() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let record = |zpid: u64, reason: &str| {
            json!({
                "id": zpid,
                "detailUrl": format!("https://www.zillow.com/homedetails/{zpid}_zpid/"),
                "price": "$1,950/mo",
                "address": "somewhere",
                "bedrooms": 2,
                "bathrooms": 1,
                "homeType": "APARTMENT",
                "area": 850,
                "match_reason": reason
            })
        };
        let reply = json!({
            "filteredRentals": [record(1003, "3 bedrooms"), record(1001, "Under budget"), record(9999, "invented")]
        });
        let client: Arc<dyn ReasoningClient> = Arc::new(ScriptedReasoning(reply.to_string()));
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source).with_strategy(
            Box::<KeywordParameterDeriver>::default(),
            Box::new(ReasoningFilterPolicy::new(client)),
        );

        let summary = pipeline
            .run(
                SearchRequest::new("cheap place in 90210", Some("sk-override".into())),
                &Credential::Override("sk-override".into()),
            )
            .await
            .unwrap();
        let output = read_output(pipeline.store(), summary.run_id).await;
        let ids: Vec<_> = output["listings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["1001", "1003"]);
        assert_eq!(summary.usage.count_for(USAGE_LLM_INPUT), None);

        let input = pipeline
            .store()
            .get_value(&summary.run_id.to_string(), INPUT_KEY, "application/json")
            .await
            .unwrap()
            .unwrap();
        assert!(!String::from_utf8(input).unwrap().contains("sk-override"));
    }

    #[tokio::test]
    async fn environment_credential_records_llm_input_usage() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(Vec::new())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);
        let request = "studio in 10001";

        let summary = pipeline
            .run(SearchRequest::new(request, None), &Credential::Environment("sk-env".into()))
            .await
            .unwrap();
        assert_eq!(summary.usage.count_for(USAGE_LLM_INPUT), Some(request.chars().count() as u64));
        assert_eq!(summary.usage.count_for(USAGE_LISTINGS_OUTPUT), Some(0));
    }

    #[tokio::test]
    async fn run_budget_overrun_is_a_timeout_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: Some(Duration::from_secs(5)),
        });
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source)
            .with_run_budget(Duration::from_millis(50));

        let summary = pipeline
            .run(SearchRequest::new("anything in 90210", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.error.unwrap().kind, "timeout");
    }

    #[tokio::test]
    async fn derivation_failure_is_stored_as_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source.clone());

        let summary = pipeline
            .run(SearchRequest::new("a flat in Lisbon", None), &Credential::Missing)
            .await
            .unwrap();
        assert_eq!(source.calls(), 0);
        let output = read_output(pipeline.store(), summary.run_id).await;
        assert_eq!(output["kind"], "derivation");
    }

    #[test]
    fn credential_override_wins_over_environment() {
        let with_override = SearchRequest::new("x", Some("sk-user".into()));
        assert_eq!(
            resolve_credential(&with_override, Some("sk-env")),
            Credential::Override("sk-user".into())
        );
        let blank_override = SearchRequest::new("x", Some("  ".into()));
        assert_eq!(
            resolve_credential(&blank_override, Some("sk-env")),
            Credential::Environment("sk-env".into())
        );
        assert_eq!(
            resolve_credential(&SearchRequest::new("x", None), Some("")),
            Credential::Missing
        );
    }

    #[test]
    fn restore_order_drops_duplicates_and_unknown_ids() {
        let candidates = rels_adapters::candidates_from_raw(&scenario_listings(), "https://www.zillow.com");
        let listing = |id: &str| Listing {
            id: id.to_string(),
            detail_url: "https://example.com".into(),
            img_src: None,
            price: "$1".into(),
            address: "a".into(),
            bedrooms: 1,
            bathrooms: 1.0,
            home_type: "APARTMENT".into(),
            area: 1.0,
            match_reason: "r".into(),
        };
        let restored = restore_retrieval_order(
            vec![listing("1002"), listing("nope"), listing("1001"), listing("1002")],
            &candidates,
        );
        let ids: Vec<_> = restored.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["1001", "1002"]);
    }

    #[tokio::test]
    async fn runs_markdown_summarises_stored_runs() {
        let dir = tempfile::tempdir().unwrap();
        let source = ScriptedSource::new(vec![Ok(scenario_listings())]);
        let pipeline = SearchPipeline::new(RunStore::new(dir.path()), source);
        let summary = pipeline
            .run(SearchRequest::new("2BR apartment under $2000 in 90210", None), &Credential::Missing)
            .await
            .unwrap();

        let md = report_runs_markdown(pipeline.store(), 5).unwrap();
        assert!(md.contains(&summary.run_id.to_string()));
        assert!(md.contains("- request: 2BR apartment under $2000 in 90210"));
        assert!(md.contains("- listings: 1"));
    }

    #[test]
    fn workspace_rules_file_configures_the_normalizer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join(WRAPPER_KEYS_RULES),
            "version: 1\nwrapper_keys:\n  - properties\n",
        )
        .unwrap();
        let mut config = PipelineConfig::from_env();
        config.workspace_root = dir.path().to_path_buf();
        let normalizer = config.normalizer().unwrap();
        assert_eq!(normalizer.wrapper_keys(), &["properties".to_string()]);
    }
}
