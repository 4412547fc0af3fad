//! Run-scoped artifact slots + JSON HTTP client for RELS.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rels-storage";

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub key: String,
    pub content_type: String,
    pub content_hash: String,
    pub file_name: String,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub written_at: DateTime<Utc>,
    pub records: Vec<StoredRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunEntry {
    pub run_id: String,
    pub path: PathBuf,
}

/// Named slots grouped per run under `{root}/{run_id}/`.
#[derive(Debug, Clone)]
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }

    /// Store bytes under a named slot using an atomic temp-file rename.
    /// Writing the same key twice replaces the earlier value.
    pub async fn set_value(
        &self,
        run_id: Uuid,
        key: &str,
        content_type: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredRecord> {
        validate_key(key)?;
        let run_dir = self.run_dir(run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating run directory {}", run_dir.display()))?;

        let file_name = slot_file_name(key, content_type);
        let absolute_path = run_dir.join(&file_name);
        let temp_path = run_dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp slot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp slot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp slot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp slot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(%run_id, key, bytes = bytes.len(), "stored slot");
        Ok(StoredRecord {
            key: key.to_string(),
            content_type: content_type.to_string(),
            content_hash: Self::sha256_hex(bytes),
            file_name,
            byte_size: bytes.len(),
        })
    }

    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        run_id: Uuid,
        key: &str,
        value: &T,
    ) -> anyhow::Result<StoredRecord> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing slot {key}"))?;
        self.set_value(run_id, key, "application/json", &bytes).await
    }

    /// Read a slot back; `None` when the run or slot does not exist.
    pub async fn get_value(
        &self,
        run_id: &str,
        key: &str,
        content_type: &str,
    ) -> anyhow::Result<Option<Vec<u8>>> {
        validate_key(run_id)?;
        validate_key(key)?;
        let path = self.root.join(run_id).join(slot_file_name(key, content_type));
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking slot path {}", path.display()))?
        {
            return Ok(None);
        }
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("reading slot {}", path.display()))?;
        Ok(Some(bytes))
    }

    pub async fn write_manifest(
        &self,
        run_id: Uuid,
        records: &[StoredRecord],
    ) -> anyhow::Result<PathBuf> {
        let manifest = RunManifest {
            run_id,
            written_at: Utc::now(),
            records: records.to_vec(),
        };
        let path = self.run_dir(run_id).join(MANIFEST_FILE);
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing run manifest")?;
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }

    /// Most recently modified runs first.
    pub fn list_runs(&self, limit: usize) -> anyhow::Result<Vec<RunEntry>> {
        if !self.root.exists() {
            return Ok(vec![]);
        }
        let mut entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("reading {}", self.root.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
            .collect::<Vec<_>>();
        entries.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
        entries.reverse();

        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| RunEntry {
                run_id: e.file_name().to_string_lossy().to_string(),
                path: e.path(),
            })
            .collect())
    }
}

/// File name backing a slot: keys that already carry an extension are used
/// as-is, others get one derived from the content type.
pub fn slot_file_name(key: &str, content_type: &str) -> String {
    if key.contains('.') {
        return key.to_string();
    }
    let ext = match content_type.split(';').next().unwrap_or_default().trim() {
        "application/json" => "json",
        "text/html" => "html",
        "text/plain" => "txt",
        _ => "bin",
    };
    format!("{key}.{ext}")
}

fn validate_key(key: &str) -> anyhow::Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!("invalid slot key {key:?}");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt; callers that own their retry budget use this.
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl JsonResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
}

/// JSON-over-HTTP client with status/transport retry classification.
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &T,
    ) -> Result<JsonResponse, FetchError> {
        let span = info_span!("http_post", url = %strip_query(url));
        self.post_json_inner(url, bearer, body).instrument(span).await
    }

    async fn post_json_inner<T: Serialize + ?Sized>(
        &self,
        url: &str,
        bearer: Option<&str>,
        body: &T,
    ) -> Result<JsonResponse, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut req = self.client.post(url).json(body);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(JsonResponse { status, body });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let text = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: strip_query(url).to_string(),
                        body: truncate_chars(&text, 500),
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        warn!(error = %err, attempt, "retryable request error");
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        match last_request_error {
            Some(err) => Err(FetchError::Request(err)),
            None => Err(FetchError::HttpStatus {
                status: 0,
                url: strip_query(url).to_string(),
                body: "retry budget exhausted".to_string(),
            }),
        }
    }
}

/// Drop the query string so tokens passed as parameters never reach logs.
pub fn strip_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn content_hashing_is_stable() {
        let hash = RunStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn slot_file_names_follow_content_type() {
        assert_eq!(slot_file_name("OUTPUT", "application/json"), "OUTPUT.json");
        assert_eq!(
            slot_file_name("real_estate_report.html", "text/html"),
            "real_estate_report.html"
        );
        assert_eq!(slot_file_name("blob", "application/octet-stream"), "blob.bin");
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_slot_value() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let run_id = Uuid::new_v4();

        let first = store
            .set_value(run_id, "OUTPUT", "application/json", b"{\"listings\":[]}")
            .await
            .expect("first store");
        let second = store
            .set_value(run_id, "OUTPUT", "application/json", b"{\"error\":\"x\"}")
            .await
            .expect("second store");

        assert_eq!(first.file_name, second.file_name);
        assert_ne!(first.content_hash, second.content_hash);
        let read = store
            .get_value(&run_id.to_string(), "OUTPUT", "application/json")
            .await
            .expect("read")
            .expect("present");
        assert_eq!(read, b"{\"error\":\"x\"}");

        let leftovers = std::fs::read_dir(store.run_dir(run_id))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        assert!(store
            .set_value(Uuid::new_v4(), "../escape", "text/plain", b"x")
            .await
            .is_err());
        assert!(store
            .get_value("..", "OUTPUT", "application/json")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn missing_slot_reads_as_none() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let value = store
            .get_value(&Uuid::new_v4().to_string(), "OUTPUT", "application/json")
            .await
            .expect("read");
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn manifest_lists_stored_records() {
        let dir = tempdir().expect("tempdir");
        let store = RunStore::new(dir.path());
        let run_id = Uuid::new_v4();
        let record = store
            .set_json(run_id, "USAGE", &serde_json::json!([{"event": "init"}]))
            .await
            .unwrap();
        let path = store.write_manifest(run_id, &[record]).await.unwrap();
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(manifest["records"][0]["key"], "USAGE");
        assert_eq!(store.list_runs(10).unwrap().len(), 1);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::no_retries().max_retries, 0);
    }

    #[test]
    fn query_strings_are_stripped_for_logging() {
        assert_eq!(
            strip_query("https://api.example.com/v2/acts/x/run?token=secret"),
            "https://api.example.com/v2/acts/x/run"
        );
    }
}
