//! Draw archive persistence + HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lotto_core::{DrawRecord, History};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, REFERER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotto-storage";

/// Format of the human-readable `last_updated` stamp in the archive file.
pub const LAST_UPDATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing to write an empty history to {path} (persisted entries: {persisted_entries})")]
    IntegrityViolation {
        path: PathBuf,
        persisted_entries: usize,
    },
    #[error("archive {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ArchiveFileOut<'a> {
    latest: &'a DrawRecord,
    history: &'a History,
    last_updated: String,
}

#[derive(Debug, Deserialize)]
struct ArchiveFileIn {
    #[serde(default)]
    latest: Option<DrawRecord>,
    #[serde(default)]
    history: Vec<DrawRecord>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Archive contents as read from disk, after sanitizing the history.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveSnapshot {
    pub latest: Option<DrawRecord>,
    pub history: History,
    pub last_updated: Option<String>,
    pub dropped_entries: usize,
}

#[derive(Debug, Clone)]
pub struct SaveReceipt {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
    pub entries: usize,
    pub head_date: String,
}

/// Owns the archive file: `{ latest, history, last_updated }`.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// Current history; empty when the archive is missing or unreadable.
    pub async fn load(&self) -> History {
        match self.load_snapshot().await {
            Ok(Some(snapshot)) => snapshot.history,
            Ok(None) => {
                info!(path = %self.path.display(), "no archive yet; starting from an empty history");
                History::new()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "archive unreadable; treating history as empty");
                History::new()
            }
        }
    }

    /// Strict read: `Ok(None)` if the file does not exist, `Err` if it cannot be parsed.
    pub async fn load_snapshot(&self) -> Result<Option<ArchiveSnapshot>, StoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking archive path {}", self.path.display()))?;
        if !exists {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading archive {}", self.path.display()))?;
        let file: ArchiveFileIn = serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let sanitized = History::from_records(file.history);
        if sanitized.dropped() > 0 {
            warn!(
                path = %self.path.display(),
                incomplete = sanitized.dropped_incomplete,
                duplicates = sanitized.dropped_duplicates,
                "dropped invalid entries while loading archive"
            );
        }
        Ok(Some(ArchiveSnapshot {
            latest: file.latest.filter(DrawRecord::is_complete),
            dropped_entries: sanitized.dropped(),
            history: sanitized.history,
            last_updated: file.last_updated,
        }))
    }

    pub async fn save(&self, history: &History) -> Result<SaveReceipt, StoreError> {
        self.save_at(history, Utc::now()).await
    }

    /// Replace the archive atomically via a temp file + rename in the same directory.
    pub async fn save_at(
        &self,
        history: &History,
        updated_at: DateTime<Utc>,
    ) -> Result<SaveReceipt, StoreError> {
        let Some(latest) = history.head() else {
            let persisted_entries = match self.load_snapshot().await {
                Ok(Some(snapshot)) => snapshot.history.len(),
                _ => 0,
            };
            return Err(StoreError::IntegrityViolation {
                path: self.path.clone(),
                persisted_entries,
            });
        };

        let file = ArchiveFileOut {
            latest,
            history,
            last_updated: updated_at.format(LAST_UPDATED_FORMAT).to_string(),
        };
        let bytes = encode_archive(&file)?;
        let content_hash = Self::sha256_hex(&bytes);

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let temp_path = dir.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut out = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        let written: std::io::Result<()> = async {
            out.write_all(&bytes).await?;
            out.flush().await?;
            out.sync_all().await
        }
        .await;
        drop(out);
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(err)
                .context(format!("writing temp archive file {}", temp_path.display()))
                .into());
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(err)
                .context(format!(
                    "atomically renaming temp archive {} -> {}",
                    temp_path.display(),
                    self.path.display()
                ))
                .into());
        }

        debug!(path = %self.path.display(), %content_hash, bytes = bytes.len(), "archive written");
        Ok(SaveReceipt {
            path: self.path.clone(),
            content_hash,
            byte_size: bytes.len(),
            entries: history.len(),
            head_date: latest.draw_date().to_string(),
        })
    }
}

/// Four-space indented JSON with non-ASCII kept verbatim.
fn encode_archive(file: &ArchiveFileOut<'_>) -> anyhow::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut bytes, formatter);
    file.serialize(&mut ser).context("serializing archive")?;
    Ok(bytes)
}

/// Responses worth asking again for: upstream rate limiting and server faults.
pub fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Transport failures worth asking again for.
pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// How often, and how patiently, a draw request is repeated after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: usize,
    pub first_pause: Duration,
    pub longest_pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            first_pause: Duration::from_millis(500),
            longest_pause: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Pause before retry number `retry` (0-based): doubles each time, up to `longest_pause`.
    pub fn pause_before(&self, retry: usize) -> Duration {
        let doubling = 2u32.checked_pow(retry as u32).unwrap_or(u32::MAX);
        self.first_pause
            .checked_mul(doubling)
            .map_or(self.longest_pause, |pause| pause.min(self.longest_pause))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    pub referer: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            accept_language: Some("en-US,en;q=0.9,th;q=0.8".to_string()),
            referer: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// Draw-source HTTP client: browser-like headers, per-request timeout, retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("draw request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream answered {status} for {url}")]
    Status { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in [
            (ACCEPT_LANGUAGE, &config.accept_language),
            (REFERER, &config.referer),
        ] {
            if let Some(value) = value {
                let value = HeaderValue::from_str(value)
                    .with_context(|| format!("invalid {name} header value {value:?}"))?;
                headers.insert(name, value);
            }
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building draw source HTTP client")?,
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut retry = 0;
        loop {
            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    let body = resp.bytes().await?.to_vec();
                    return Ok(FetchedResponse {
                        status,
                        final_url,
                        body,
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let error = FetchError::Status {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (is_transient_status(status), error)
                }
                Err(err) => (is_transient_error(&err), FetchError::Transport(err)),
            };

            match failure {
                (true, error) if retry < self.retry.retries => {
                    let pause = self.retry.pause_before(retry);
                    debug!(retry, error = %error, pause_ms = pause.as_millis() as u64, "transient failure; retrying");
                    tokio::time::sleep(pause).await;
                    retry += 1;
                }
                (_, error) => return Err(error),
            }
        }
    }
}
