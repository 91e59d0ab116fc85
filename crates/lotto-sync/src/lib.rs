//! Draw history synchronization: strategy selection, incremental update,
//! paginated backfill, and the env/`sources.yaml` driven entry points.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use lotto_adapters::{
    ApiDrawSource, DrawSource, FetchContext, MarkupDrawSource, MarkupEndpoints, MarkupSelectors,
    SourceError, SourceKind, RAYRIFFY_BASE_URL, RAYRIFFY_SOURCE_ID,
};
use lotto_core::{merge, overlay, DrawField, DrawId, DrawRecord, History};
use lotto_notify::{FcmCredentials, FcmNotifier, LogNotifier, Notifier, NotifyError, NotifyReport};
use lotto_storage::{HistoryStore, HttpClientConfig, HttpFetcher, SaveReceipt, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotto-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9,th;q=0.8,zh-CN;q=0.7,zh;q=0.6";

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    Incremental,
    Backfill,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStrategy::Incremental => "incremental",
            SyncStrategy::Backfill => "backfill",
        })
    }
}

/// Thresholds and limits that drive a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Minimum history length for which fetching only the latest draw is enough.
    pub incremental_threshold: usize,
    pub retention_limit: usize,
    pub backfill_target: usize,
    pub max_listing_pages: u32,
    /// Delay between consecutive historical requests.
    pub pacing: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            incremental_threshold: 48,
            retention_limit: 100,
            backfill_target: 50,
            max_listing_pages: 10,
            pacing: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("incremental threshold {threshold} exceeds {limit_name} {limit}; every run would backfill")]
    NeverConverges {
        threshold: usize,
        limit_name: &'static str,
        limit: usize,
    },
}

impl SyncPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.retention_limit == 0 {
            return Err(PolicyError::Zero("retention limit"));
        }
        if self.backfill_target == 0 {
            return Err(PolicyError::Zero("backfill target"));
        }
        if self.max_listing_pages == 0 {
            return Err(PolicyError::Zero("max listing pages"));
        }
        for (limit_name, limit) in [
            ("backfill target", self.backfill_target),
            ("retention limit", self.retention_limit),
        ] {
            if self.incremental_threshold > limit {
                return Err(PolicyError::NeverConverges {
                    threshold: self.incremental_threshold,
                    limit_name,
                    limit,
                });
            }
        }
        Ok(())
    }

    pub fn select_strategy(&self, history_len: usize) -> SyncStrategy {
        if history_len > 0 && history_len >= self.incremental_threshold {
            SyncStrategy::Incremental
        } else {
            SyncStrategy::Backfill
        }
    }

    /// Upper bound on the number of entries a backfill persists.
    pub fn backfill_cap(&self) -> usize {
        self.backfill_target.min(self.retention_limit)
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoChangeReason {
    AlreadyCurrent { draw_date: String },
    DrawPending {
        draw_date: Option<String>,
        fields: Vec<DrawField>,
    },
    /// The latest draw is already in the history, but not at its head.
    StaleLatest { draw_date: String },
}

#[derive(Debug, Error)]
pub enum SyncFailure {
    #[error("fetching {stage} failed: {source}")]
    Transport {
        stage: &'static str,
        #[source]
        source: SourceError,
    },
    #[error("backfill produced no valid draws from {identifiers} identifiers")]
    EmptyBackfill { identifiers: usize },
    #[error("persisting history failed: {0}")]
    Persistence(#[source] StoreError),
    #[error("integrity check rejected the write: {0}")]
    Integrity(#[source] StoreError),
}

impl From<StoreError> for SyncFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IntegrityViolation { .. } => SyncFailure::Integrity(err),
            other => SyncFailure::Persistence(other),
        }
    }
}

#[derive(Debug)]
pub enum SyncOutcome {
    NoChange(NoChangeReason),
    Updated(DrawRecord),
    BackfillCompleted {
        count: usize,
        head: DrawRecord,
        /// False when the archive grew below an unchanged head.
        new_head: bool,
    },
    Failed(SyncFailure),
}

impl SyncOutcome {
    /// The new head record when the run put a new draw at the top of the archive.
    pub fn notification_payload(&self) -> Option<&DrawRecord> {
        match self {
            SyncOutcome::Updated(record) => Some(record),
            SyncOutcome::BackfillCompleted {
                head,
                new_head: true,
                ..
            } => Some(head),
            SyncOutcome::BackfillCompleted { .. }
            | SyncOutcome::NoChange(_)
            | SyncOutcome::Failed(_) => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SyncOutcome::Failed(_))
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::NoChange(NoChangeReason::AlreadyCurrent { draw_date }) => {
                write!(f, "no change: {draw_date} is already the latest draw")
            }
            SyncOutcome::NoChange(NoChangeReason::DrawPending { draw_date, fields }) => {
                let fields = fields
                    .iter()
                    .map(|f| f.archive_name())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "no change: draw {} still pending ({fields})",
                    draw_date.as_deref().unwrap_or("<undated>")
                )
            }
            SyncOutcome::NoChange(NoChangeReason::StaleLatest { draw_date }) => {
                write!(f, "no change: upstream latest {draw_date} is older than the archive head")
            }
            SyncOutcome::Updated(record) => write!(f, "updated: new head {}", record.draw_date()),
            SyncOutcome::BackfillCompleted { count, head, .. } => {
                write!(f, "backfill completed: {count} draws, head {}", head.draw_date())
            }
            SyncOutcome::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

pub struct Synchronizer {
    store: HistoryStore,
    source: Box<dyn DrawSource>,
    policy: SyncPolicy,
}

impl Synchronizer {
    pub fn new(store: HistoryStore, source: Box<dyn DrawSource>, policy: SyncPolicy) -> Self {
        Self {
            store,
            source,
            policy,
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn source_id(&self) -> &str {
        self.source.source_id()
    }

    pub async fn run(&self) -> SyncOutcome {
        self.run_with_id(Uuid::new_v4()).await
    }

    /// One load, zero or more sequential fetches, at most one save.
    pub async fn run_with_id(&self, run_id: Uuid) -> SyncOutcome {
        let history = self.store.load().await;
        let state = history.sync_state();
        let strategy = self.policy.select_strategy(state.existing_history_length);
        let span = info_span!(
            "sync_run",
            %run_id,
            source_id = self.source.source_id(),
            kind = ?self.source.kind(),
            %strategy
        );
        let ctx = FetchContext { run_id };
        async move {
            info!(
                existing_entries = state.existing_history_length,
                existing_head = state.existing_latest_date.as_deref().unwrap_or("-"),
                "sync started"
            );
            let outcome = match strategy {
                SyncStrategy::Incremental => self.incremental(&ctx, history).await,
                SyncStrategy::Backfill => self.backfill(&ctx, history).await,
            };
            match &outcome {
                SyncOutcome::Failed(reason) => error!(error = %reason, "sync failed"),
                other => info!(outcome = %other, "sync finished"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn incremental(&self, ctx: &FetchContext, history: History) -> SyncOutcome {
        let raw = match self.source.fetch_latest(ctx).await {
            Ok(raw) => raw,
            Err(source) => {
                return SyncOutcome::Failed(SyncFailure::Transport {
                    stage: "latest draw",
                    source,
                })
            }
        };
        let record = match DrawRecord::from_raw(raw) {
            Ok(record) => record,
            Err(pending) => {
                info!(%pending, "latest draw not final yet; archive left untouched");
                return SyncOutcome::NoChange(NoChangeReason::DrawPending {
                    draw_date: pending.draw_date,
                    fields: pending.fields,
                });
            }
        };

        let draw_date = record.draw_date().to_string();
        if history.head_date() == Some(draw_date.as_str()) {
            return SyncOutcome::NoChange(NoChangeReason::AlreadyCurrent { draw_date });
        }
        if history.contains_date(&draw_date) {
            warn!(
                %draw_date,
                head = history.head_date().unwrap_or("-"),
                "upstream latest is below the archive head"
            );
            return SyncOutcome::NoChange(NoChangeReason::StaleLatest { draw_date });
        }

        let merged = merge(history, record.clone(), self.policy.retention_limit);
        match self.persist(&merged).await {
            Ok(_) => SyncOutcome::Updated(record),
            Err(failure) => SyncOutcome::Failed(failure),
        }
    }

    /// Rebuilds the history from the listing. A result at least as long as the
    /// archive replaces it; a shorter one only contributes draws newer than the
    /// archive head.
    async fn backfill(&self, ctx: &FetchContext, existing: History) -> SyncOutcome {
        let ids = match self.collect_identifiers(ctx).await {
            Ok(ids) => ids,
            Err(failure) => return SyncOutcome::Failed(failure),
        };
        info!(identifiers = ids.len(), "fetching draw details");

        let mut records = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if index > 0 {
                self.pace().await;
            }
            let raw = match self.source.fetch_detail(ctx, id).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(draw_id = %id, error = %err, "detail fetch failed; skipping");
                    continue;
                }
            };
            match DrawRecord::from_raw(raw) {
                Ok(record) => records.push(record),
                Err(pending) => debug!(draw_id = %id, %pending, "skipping incomplete draw"),
            }
        }

        let sanitized = History::from_records(records);
        if sanitized.dropped_duplicates > 0 {
            warn!(
                duplicates = sanitized.dropped_duplicates,
                "backfill returned repeated draw dates; kept the first occurrence"
            );
        }
        let fetched = sanitized.history.truncated(self.policy.backfill_cap());
        if fetched.is_empty() {
            return SyncOutcome::Failed(SyncFailure::EmptyBackfill {
                identifiers: ids.len(),
            });
        }

        let previous_head = existing.head_date().map(ToString::to_string);
        let history = if fetched.len() >= existing.len() {
            fetched
        } else {
            info!(
                fetched = fetched.len(),
                existing = existing.len(),
                "partial backfill; keeping archived draws"
            );
            overlay(fetched, existing.clone(), self.policy.retention_limit)
        };
        let Some(head) = history.head().cloned() else {
            return SyncOutcome::Failed(SyncFailure::EmptyBackfill {
                identifiers: ids.len(),
            });
        };
        if history == existing {
            return SyncOutcome::NoChange(NoChangeReason::AlreadyCurrent {
                draw_date: head.draw_date().to_string(),
            });
        }

        match self.persist(&history).await {
            Ok(receipt) => SyncOutcome::BackfillCompleted {
                count: receipt.entries,
                new_head: previous_head.as_deref() != Some(head.draw_date()),
                head,
            },
            Err(failure) => SyncOutcome::Failed(failure),
        }
    }

    /// Walks listing pages until the backfill target is reached, a page is
    /// empty, or the page limit is hit. Ids that repeat or break newest-first
    /// order are skipped.
    async fn collect_identifiers(&self, ctx: &FetchContext) -> Result<Vec<DrawId>, SyncFailure> {
        let target = self.policy.backfill_target;
        let mut ids: Vec<DrawId> = Vec::new();
        let mut seen = HashSet::new();
        let mut newest_so_far: Option<(u32, DrawId)> = None;

        for page in 1..=self.policy.max_listing_pages {
            if page > 1 {
                self.pace().await;
            }
            let listed = match self.source.list_identifiers(ctx, page).await {
                Ok(listed) => listed,
                Err(source) if ids.is_empty() => {
                    return Err(SyncFailure::Transport {
                        stage: "draw listing",
                        source,
                    })
                }
                Err(err) => {
                    warn!(page, error = %err, gathered = ids.len(), "listing page failed; continuing with gathered ids");
                    break;
                }
            };
            if listed.is_empty() {
                debug!(page, "listing exhausted");
                break;
            }

            for id in listed {
                if !seen.insert(id.clone()) {
                    continue;
                }
                if let Some(key) = self.source.recency_key(&id) {
                    if let Some((previous_key, previous_id)) = &newest_so_far {
                        if key >= *previous_key {
                            warn!(
                                draw_id = %id,
                                previous = %previous_id,
                                "listing out of newest-first order; skipping id"
                            );
                            continue;
                        }
                    }
                    newest_so_far = Some((key, id.clone()));
                }
                ids.push(id);
            }
            debug!(page, gathered = ids.len(), "listing page collected");
            if ids.len() >= target {
                break;
            }
        }

        ids.truncate(target);
        if ids.is_empty() {
            return Err(SyncFailure::EmptyBackfill { identifiers: 0 });
        }
        Ok(ids)
    }

    async fn persist(&self, history: &History) -> Result<SaveReceipt, SyncFailure> {
        let receipt = self.store.save(history).await?;
        info!(
            path = %receipt.path.display(),
            entries = receipt.entries,
            head = %receipt.head_date,
            content_hash = %receipt.content_hash,
            "history persisted"
        );
        Ok(receipt)
    }

    async fn pace(&self) {
        if !self.policy.pacing.is_zero() {
            tokio::time::sleep(self.policy.pacing).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub markup: Option<MarkupSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkupSourceConfig {
    #[serde(flatten)]
    pub endpoints: MarkupEndpoints,
    #[serde(default)]
    pub selectors: MarkupSelectors,
}

impl SourceRegistry {
    /// Registry used when no `sources.yaml` is present.
    pub fn builtin() -> Self {
        Self {
            sources: vec![SourceConfig {
                source_id: RAYRIFFY_SOURCE_ID.to_string(),
                display_name: "Rayriffy Thai Lottery API".to_string(),
                enabled: true,
                kind: SourceKind::Api,
                base_url: Some(RAYRIFFY_BASE_URL.to_string()),
                referer: Some(format!("{RAYRIFFY_BASE_URL}/")),
                markup: None,
            }],
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking {}", path.display()))?;
        if !exists {
            debug!(path = %path.display(), "no source registry; using built-in API source");
            return Ok(Self::builtin());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn first_enabled(&self) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub history_path: PathBuf,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub policy: SyncPolicy,
    pub fcm: Option<FcmCredentials>,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = SyncPolicy::default();
        let fcm = match (
            std::env::var("FCM_PROJECT_ID"),
            std::env::var("FCM_ACCESS_TOKEN"),
        ) {
            (Ok(project_id), Ok(access_token))
                if !project_id.trim().is_empty() && !access_token.trim().is_empty() =>
            {
                Some(FcmCredentials {
                    project_id: project_id.trim().to_string(),
                    access_token: access_token.trim().to_string(),
                })
            }
            _ => None,
        };
        Self {
            history_path: std::env::var("LOTTO_HISTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./lotto_results.json")),
            sources_path: std::env::var("LOTTO_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./sources.yaml")),
            user_agent: std::env::var("LOTTO_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_or("LOTTO_HTTP_TIMEOUT_SECS", 15),
            policy: SyncPolicy {
                incremental_threshold: env_or(
                    "LOTTO_INCREMENTAL_THRESHOLD",
                    defaults.incremental_threshold,
                ),
                retention_limit: env_or("LOTTO_RETENTION_LIMIT", defaults.retention_limit),
                backfill_target: env_or("LOTTO_BACKFILL_TARGET", defaults.backfill_target),
                max_listing_pages: env_or("LOTTO_MAX_LISTING_PAGES", defaults.max_listing_pages),
                pacing: Duration::from_millis(env_or(
                    "LOTTO_PACING_MS",
                    defaults.pacing.as_millis() as u64,
                )),
            },
            fcm,
        }
    }

    pub fn http_config(&self, referer: Option<String>) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            accept_language: Some(DEFAULT_ACCEPT_LANGUAGE.to_string()),
            referer,
            ..Default::default()
        }
    }

    pub fn notifier(&self) -> Box<dyn Notifier> {
        match &self.fcm {
            Some(credentials) => Box::new(FcmNotifier::new(credentials.clone())),
            None => Box::new(LogNotifier),
        }
    }
}

/// Builds the fetcher for one configured source.
pub fn build_source(source: &SourceConfig, config: &SyncConfig) -> Result<Box<dyn DrawSource>> {
    let http = Arc::new(HttpFetcher::new(config.http_config(source.referer.clone()))?);
    match source.kind {
        SourceKind::Api => {
            let base_url = source.base_url.as_deref().unwrap_or(RAYRIFFY_BASE_URL);
            Ok(Box::new(ApiDrawSource::new(&source.source_id, base_url, http)))
        }
        SourceKind::Html => {
            let Some(markup) = &source.markup else {
                bail!("source {} is kind html but has no markup block", source.source_id);
            };
            Ok(Box::new(MarkupDrawSource::new(
                &source.source_id,
                markup.endpoints.clone(),
                markup.selectors.clone(),
                http,
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub source_name: String,
    pub outcome: SyncOutcome,
    /// Present when the outcome carried a new head and a notifier ran.
    pub notification: Option<NotifyReport>,
}

/// Hands the new head to the notifier. Notification problems never fail the run.
pub async fn notify_outcome(notifier: &dyn Notifier, outcome: &SyncOutcome) -> Option<NotifyReport> {
    let record = outcome.notification_payload()?;
    match notifier.notify(record).await {
        Ok(report) => {
            info!(
                notifier = notifier.name(),
                delivered = report.delivered,
                attempted = report.attempted,
                "notifications dispatched"
            );
            Some(report)
        }
        Err(NotifyError::NothingDelivered { report, .. }) => {
            warn!(notifier = notifier.name(), attempted = report.attempted, "no notification delivered");
            Some(report)
        }
        Err(err) => {
            warn!(notifier = notifier.name(), error = %err, "notification failed");
            None
        }
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    config.policy.validate().context("invalid sync policy")?;

    let registry = SourceRegistry::load_or_builtin(&config.sources_path).await?;
    let Some(source_config) = registry.first_enabled() else {
        bail!("no enabled source in {}", config.sources_path.display());
    };
    let source = build_source(source_config, &config)?;
    let source_id = source.source_id().to_string();
    info!(
        %source_id,
        display_name = %source_config.display_name,
        kind = ?source.kind(),
        "source selected"
    );

    let synchronizer = Synchronizer::new(
        HistoryStore::new(&config.history_path),
        source,
        config.policy.clone(),
    );

    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let outcome = synchronizer.run_with_id(run_id).await;
    let notification = notify_outcome(config.notifier().as_ref(), &outcome).await;

    Ok(SyncRunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        source_id,
        source_name: source_config.display_name.clone(),
        outcome,
        notification,
    })
}

/// Re-sends the notification for the archived latest draw.
pub async fn notify_latest_from_env() -> Result<NotifyReport> {
    let config = SyncConfig::from_env();
    let store = HistoryStore::new(&config.history_path);
    let snapshot = store
        .load_snapshot()
        .await?
        .with_context(|| format!("no archive at {}", config.history_path.display()))?;
    let Some(latest) = snapshot.latest.or_else(|| snapshot.history.head().cloned()) else {
        bail!("archive {} holds no complete draw", config.history_path.display());
    };
    let notifier = config.notifier();
    let report = notifier
        .notify(&latest)
        .await
        .with_context(|| format!("notifying draw {}", latest.draw_date()))?;
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct ArchiveStatus {
    pub path: PathBuf,
    pub entries: usize,
    pub head_date: Option<String>,
    pub last_updated: Option<String>,
    pub dropped_entries: usize,
    pub next_strategy: SyncStrategy,
}

pub async fn archive_status_from_env() -> Result<ArchiveStatus> {
    let config = SyncConfig::from_env();
    archive_status(&HistoryStore::new(&config.history_path), &config.policy).await
}

pub async fn archive_status(store: &HistoryStore, policy: &SyncPolicy) -> Result<ArchiveStatus> {
    let snapshot = store.load_snapshot().await?;
    let (entries, head_date, last_updated, dropped_entries) = match snapshot {
        Some(s) => (
            s.history.len(),
            s.history.head_date().map(ToString::to_string),
            s.last_updated,
            s.dropped_entries,
        ),
        None => (0, None, None, 0),
    };
    Ok(ArchiveStatus {
        path: store.path().to_path_buf(),
        entries,
        head_date,
        last_updated,
        dropped_entries,
        next_strategy: policy.select_strategy(entries),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotto_core::RawDraw;

    fn record(date: &str) -> DrawRecord {
        DrawRecord::from_raw(RawDraw::new(date, "782931", "128, 213", "068, 666", "06")).unwrap()
    }

    #[test]
    fn default_policy_is_valid() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.validate(), Ok(()));
        assert_eq!(policy.backfill_cap(), 50);
    }

    #[test]
    fn strategy_switches_at_threshold() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.select_strategy(0), SyncStrategy::Backfill);
        assert_eq!(policy.select_strategy(10), SyncStrategy::Backfill);
        assert_eq!(policy.select_strategy(47), SyncStrategy::Backfill);
        assert_eq!(policy.select_strategy(48), SyncStrategy::Incremental);
        assert_eq!(policy.select_strategy(100), SyncStrategy::Incremental);
    }

    #[test]
    fn zero_threshold_still_backfills_an_empty_history() {
        let policy = SyncPolicy {
            incremental_threshold: 0,
            ..SyncPolicy::default()
        };
        assert_eq!(policy.select_strategy(0), SyncStrategy::Backfill);
        assert_eq!(policy.select_strategy(1), SyncStrategy::Incremental);
    }

    #[test]
    fn policy_rejects_non_converging_threshold() {
        let policy = SyncPolicy {
            incremental_threshold: 60,
            ..SyncPolicy::default()
        };
        assert_eq!(
            policy.validate(),
            Err(PolicyError::NeverConverges {
                threshold: 60,
                limit_name: "backfill target",
                limit: 50,
            })
        );

        let policy = SyncPolicy {
            incremental_threshold: 48,
            backfill_target: 80,
            retention_limit: 40,
            ..SyncPolicy::default()
        };
        assert!(matches!(
            policy.validate(),
            Err(PolicyError::NeverConverges { limit_name: "retention limit", .. })
        ));
        assert_eq!(policy.backfill_cap(), 40);
    }

    #[test]
    fn policy_rejects_zero_limits() {
        let policy = SyncPolicy {
            retention_limit: 0,
            incremental_threshold: 0,
            ..SyncPolicy::default()
        };
        assert_eq!(policy.validate(), Err(PolicyError::Zero("retention limit")));
    }

    #[test]
    fn only_changes_carry_a_notification_payload() {
        let updated = SyncOutcome::Updated(record("1 กรกฎาคม 2567"));
        assert_eq!(
            updated.notification_payload().map(DrawRecord::draw_date),
            Some("1 กรกฎาคม 2567")
        );
        let backfilled = SyncOutcome::BackfillCompleted {
            count: 3,
            head: record("16 มิถุนายน 2567"),
            new_head: true,
        };
        assert_eq!(
            backfilled.notification_payload().map(DrawRecord::draw_date),
            Some("16 มิถุนายน 2567")
        );
        let grown = SyncOutcome::BackfillCompleted {
            count: 50,
            head: record("16 มิถุนายน 2567"),
            new_head: false,
        };
        assert!(grown.notification_payload().is_none());

        let unchanged = SyncOutcome::NoChange(NoChangeReason::AlreadyCurrent {
            draw_date: "1 กรกฎาคม 2567".into(),
        });
        assert!(unchanged.notification_payload().is_none());
        assert!(!unchanged.is_failure());

        let failed = SyncOutcome::Failed(SyncFailure::EmptyBackfill { identifiers: 5 });
        assert!(failed.notification_payload().is_none());
        assert!(failed.is_failure());
    }

    #[test]
    fn integrity_violation_maps_to_integrity_failure() {
        let failure = SyncFailure::from(StoreError::IntegrityViolation {
            path: PathBuf::from("lotto_results.json"),
            persisted_entries: 12,
        });
        assert!(matches!(failure, SyncFailure::Integrity(_)));

        let failure = SyncFailure::from(StoreError::Corrupt {
            path: PathBuf::from("lotto_results.json"),
            reason: "eof".into(),
        });
        assert!(matches!(failure, SyncFailure::Persistence(_)));
    }

    #[test]
    fn pending_outcome_names_fields() {
        let outcome = SyncOutcome::NoChange(NoChangeReason::DrawPending {
            draw_date: Some("16 กรกฎาคม 2567".into()),
            fields: vec![DrawField::FrontThree, DrawField::BackTwo],
        });
        assert_eq!(
            outcome.to_string(),
            "no change: draw 16 กรกฎาคม 2567 still pending (top3, bottom2)"
        );
    }

    #[test]
    fn registry_parses_api_and_markup_sources() {
        let registry = SourceRegistry::from_yaml_str(
            r#"
sources:
  - source_id: mirror-html
    display_name: Mirror
    enabled: false
    kind: html
    base_url: https://mirror.example
    markup:
      latest_url: https://mirror.example/latest
      listing_url: https://mirror.example/list?page={page}
      detail_url: https://mirror.example/draw/{id}
      selectors:
        date: "h1.date"
  - source_id: rayriffy-api
    display_name: Rayriffy
    enabled: true
    kind: api
    base_url: https://lotto.api.rayriffy.com
"#,
        )
        .unwrap();
        assert_eq!(registry.sources.len(), 2);

        let markup = registry.sources[0].markup.as_ref().unwrap();
        assert_eq!(markup.endpoints.detail_url, "https://mirror.example/draw/{id}");
        assert_eq!(markup.selectors.date, "h1.date");
        assert_eq!(markup.selectors.back_two, MarkupSelectors::default().back_two);

        let first = registry.first_enabled().unwrap();
        assert_eq!(first.source_id, "rayriffy-api");
        assert_eq!(first.kind, SourceKind::Api);
    }

    #[test]
    fn html_source_without_markup_is_rejected() {
        let source = SourceConfig {
            source_id: "broken".into(),
            display_name: "Broken".into(),
            enabled: true,
            kind: SourceKind::Html,
            base_url: None,
            referer: None,
            markup: None,
        };
        let config = SyncConfig {
            history_path: PathBuf::from("lotto_results.json"),
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            policy: SyncPolicy::default(),
            fcm: None,
        };
        let err = build_source(&source, &config).err().unwrap();
        assert!(err.to_string().contains("no markup block"));
    }

    #[test]
    fn builtin_registry_builds_the_json_api_source() {
        let config = SyncConfig {
            history_path: PathBuf::from("lotto_results.json"),
            sources_path: PathBuf::from("sources.yaml"),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            policy: SyncPolicy::default(),
            fcm: None,
        };
        let registry = SourceRegistry::builtin();
        let source_config = registry.first_enabled().unwrap();
        assert_eq!(source_config.display_name, "Rayriffy Thai Lottery API");

        let source = build_source(source_config, &config).unwrap();
        assert_eq!(source.source_id(), RAYRIFFY_SOURCE_ID);
        assert_eq!(source.kind(), SourceKind::Api);
    }

    #[tokio::test]
    async fn missing_registry_falls_back_to_builtin_source() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SourceRegistry::load_or_builtin(&dir.path().join("sources.yaml"))
            .await
            .unwrap();
        let source = registry.first_enabled().unwrap();
        assert_eq!(source.source_id, RAYRIFFY_SOURCE_ID);
        assert_eq!(source.base_url.as_deref(), Some(RAYRIFFY_BASE_URL));
    }

    #[tokio::test]
    async fn status_of_missing_archive_suggests_backfill() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path().join("lotto_results.json"));
        let status = archive_status(&store, &SyncPolicy::default()).await.unwrap();
        assert_eq!(status.entries, 0);
        assert_eq!(status.head_date, None);
        assert_eq!(status.next_strategy, SyncStrategy::Backfill);
    }

    #[tokio::test]
    async fn log_notifier_receives_the_new_head() {
        let outcome = SyncOutcome::Updated(record("1 กรกฎาคม 2567"));
        let report = notify_outcome(&LogNotifier, &outcome).await.unwrap();
        assert_eq!(report.delivered, 4);

        let unchanged = SyncOutcome::NoChange(NoChangeReason::StaleLatest {
            draw_date: "x".into(),
        });
        assert!(notify_outcome(&LogNotifier, &unchanged).await.is_none());
    }
}
