//! Draw source contracts + JSON API and markup page implementations.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use lotto_core::{DrawId, RawDraw};
use lotto_storage::{FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "lotto-adapters";

pub const RAYRIFFY_SOURCE_ID: &str = "rayriffy-api";
pub const RAYRIFFY_BASE_URL: &str = "https://lotto.api.rayriffy.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Html,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("upstream reported status {status:?}")]
    Upstream { status: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Everything the synchronizer needs from an upstream: the latest draw, paged
/// historical ids (newest first), and per-id detail.
#[async_trait]
pub trait DrawSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> SourceKind;

    async fn fetch_latest(&self, ctx: &FetchContext) -> Result<RawDraw, SourceError>;

    /// `page` starts at 1. An empty page means the listing is exhausted.
    async fn list_identifiers(
        &self,
        ctx: &FetchContext,
        page: u32,
    ) -> Result<Vec<DrawId>, SourceError>;

    async fn fetch_detail(&self, ctx: &FetchContext, id: &DrawId) -> Result<RawDraw, SourceError>;

    /// Ordering key derived from an id (larger is newer), when the id format allows it.
    fn recency_key(&self, _id: &DrawId) -> Option<u32> {
        None
    }
}

/// Decodes the trailing eight digits of an id as `DDMMYYYY` into `YYYYMMDD`.
pub fn ddmmyyyy_recency_key(id: &str) -> Option<u32> {
    let digits: String = id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if digits.len() < 8 {
        return None;
    }
    let tail = &digits[digits.len() - 8..];
    let day: u32 = tail[0..2].parse().ok()?;
    let month: u32 = tail[2..4].parse().ok()?;
    let year: u32 = tail[4..8].parse().ok()?;
    if !(1..=31).contains(&day) || !(1..=12).contains(&month) {
        return None;
    }
    Some(year * 10_000 + month * 100 + day)
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn join_numbers(numbers: &[String]) -> Option<String> {
    let parts = numbers
        .iter()
        .filter_map(|n| text_or_none(n))
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

// ---------------------------------------------------------------------------
// JSON API (lotto.api.rayriffy.com layout)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    status: String,
    response: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiDraw {
    date: Option<String>,
    #[serde(default)]
    prizes: Vec<ApiNumberGroup>,
    #[serde(default, rename = "runningNumbers")]
    running_numbers: Vec<ApiNumberGroup>,
}

#[derive(Debug, Deserialize)]
struct ApiNumberGroup {
    id: String,
    #[serde(default)]
    number: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiListingEntry {
    id: String,
}

fn unwrap_envelope<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SourceError> {
    let envelope: ApiEnvelope<T> = serde_json::from_slice(bytes)
        .map_err(|e| SourceError::Malformed(format!("invalid API JSON: {e}")))?;
    if envelope.status != "success" {
        return Err(SourceError::Upstream {
            status: envelope.status,
        });
    }
    envelope
        .response
        .ok_or_else(|| SourceError::Malformed("API envelope has no response".to_string()))
}

fn running_number(groups: &[ApiNumberGroup], id: &str) -> Option<String> {
    groups
        .iter()
        .find(|g| g.id == id)
        .and_then(|g| join_numbers(&g.number))
}

/// Parses a `/latest` or `/lotto/{id}` payload.
pub fn parse_api_draw(bytes: &[u8]) -> Result<RawDraw, SourceError> {
    let draw: ApiDraw = unwrap_envelope(bytes)?;
    let first_prize = draw
        .prizes
        .iter()
        .find(|p| p.id == "prizeFirst")
        .or_else(|| draw.prizes.first())
        .and_then(|p| p.number.first())
        .and_then(|n| text_or_none(n));

    Ok(RawDraw {
        draw_date: draw.date.as_deref().and_then(text_or_none),
        first_prize,
        front_three: running_number(&draw.running_numbers, "runningNumberFrontThree"),
        back_three: running_number(&draw.running_numbers, "runningNumberBackThree"),
        back_two: running_number(&draw.running_numbers, "runningNumberBackTwo"),
    })
}

/// Parses a `/list/{page}` payload into ids, in listing order.
pub fn parse_api_listing(bytes: &[u8]) -> Result<Vec<DrawId>, SourceError> {
    let entries: Vec<ApiListingEntry> = unwrap_envelope(bytes)?;
    Ok(entries
        .into_iter()
        .filter_map(|e| text_or_none(&e.id))
        .map(DrawId::new)
        .collect())
}

#[derive(Debug, Clone)]
pub struct ApiDrawSource {
    source_id: String,
    base_url: String,
    http: Arc<HttpFetcher>,
}

impl ApiDrawSource {
    pub fn new(source_id: impl Into<String>, base_url: &str, http: Arc<HttpFetcher>) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn get(&self, ctx: &FetchContext, path: &str) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/{path}", self.base_url);
        let resp = self.http.fetch_bytes(ctx.run_id, &self.source_id, &url).await?;
        Ok(resp.body)
    }
}

#[async_trait]
impl DrawSource for ApiDrawSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Api
    }

    async fn fetch_latest(&self, ctx: &FetchContext) -> Result<RawDraw, SourceError> {
        let body = self.get(ctx, "latest").await?;
        parse_api_draw(&body)
    }

    async fn list_identifiers(
        &self,
        ctx: &FetchContext,
        page: u32,
    ) -> Result<Vec<DrawId>, SourceError> {
        let body = self.get(ctx, &format!("list/{page}")).await?;
        let ids = parse_api_listing(&body)?;
        debug!(source_id = %self.source_id, page, count = ids.len(), "listing page parsed");
        Ok(ids)
    }

    async fn fetch_detail(&self, ctx: &FetchContext, id: &DrawId) -> Result<RawDraw, SourceError> {
        let body = self.get(ctx, &format!("lotto/{id}")).await?;
        parse_api_draw(&body)
    }

    fn recency_key(&self, id: &DrawId) -> Option<u32> {
        ddmmyyyy_recency_key(id.as_str())
    }
}

// ---------------------------------------------------------------------------
// Markup pages
// ---------------------------------------------------------------------------

/// CSS selectors locating the five draw fields and the listing links on a result page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkupSelectors {
    pub date: String,
    pub first_prize: String,
    pub front_three: String,
    pub back_three: String,
    pub back_two: String,
    pub listing_link: String,
    pub listing_link_attr: String,
}

impl Default for MarkupSelectors {
    fn default() -> Self {
        Self {
            date: ".draw-date".to_string(),
            first_prize: ".prize-first .number".to_string(),
            front_three: ".front-three .number".to_string(),
            back_three: ".back-three .number".to_string(),
            back_two: ".back-two .number".to_string(),
            listing_link: "a.draw-link".to_string(),
            listing_link_attr: "href".to_string(),
        }
    }
}

/// URL templates; `{page}` and `{id}` are substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkupEndpoints {
    pub latest_url: String,
    pub listing_url: String,
    pub detail_url: String,
}

fn parse_selector(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector)
        .map_err(|e| SourceError::Malformed(format!("bad selector {selector:?}: {e}")))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, SourceError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(&n.text().collect::<String>())))
}

fn select_joined_texts(document: &Html, selector: &str) -> Result<Option<String>, SourceError> {
    let sel = parse_selector(selector)?;
    let texts = document
        .select(&sel)
        .map(|n| n.text().collect::<String>())
        .collect::<Vec<_>>();
    Ok(join_numbers(&texts))
}

/// Last path segment of a link, without query string or fragment.
fn id_from_link(link: &str) -> Option<String> {
    let path = link.split(['?', '#']).next().unwrap_or(link);
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .and_then(text_or_none)
}

pub fn parse_markup_draw(html: &str, selectors: &MarkupSelectors) -> Result<RawDraw, SourceError> {
    let document = Html::parse_document(html);
    Ok(RawDraw {
        draw_date: select_first_text(&document, &selectors.date)?,
        first_prize: select_first_text(&document, &selectors.first_prize)?,
        front_three: select_joined_texts(&document, &selectors.front_three)?,
        back_three: select_joined_texts(&document, &selectors.back_three)?,
        back_two: select_first_text(&document, &selectors.back_two)?,
    })
}

/// Ids from listing links in document order; repeated links are kept once.
pub fn parse_markup_listing(
    html: &str,
    selectors: &MarkupSelectors,
) -> Result<Vec<DrawId>, SourceError> {
    let document = Html::parse_document(html);
    let sel = parse_selector(&selectors.listing_link)?;
    let mut seen = HashSet::new();
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(&selectors.listing_link_attr))
        .filter_map(id_from_link)
        .filter(|id| seen.insert(id.clone()))
        .map(DrawId::new)
        .collect())
}

#[derive(Debug, Clone)]
pub struct MarkupDrawSource {
    source_id: String,
    endpoints: MarkupEndpoints,
    selectors: MarkupSelectors,
    http: Arc<HttpFetcher>,
}

impl MarkupDrawSource {
    pub fn new(
        source_id: impl Into<String>,
        endpoints: MarkupEndpoints,
        selectors: MarkupSelectors,
        http: Arc<HttpFetcher>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            endpoints,
            selectors,
            http,
        }
    }

    async fn get_text(&self, ctx: &FetchContext, url: &str) -> Result<String, SourceError> {
        let resp = self.http.fetch_bytes(ctx.run_id, &self.source_id, url).await?;
        Ok(String::from_utf8_lossy(&resp.body).into_owned())
    }
}

#[async_trait]
impl DrawSource for MarkupDrawSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Html
    }

    async fn fetch_latest(&self, ctx: &FetchContext) -> Result<RawDraw, SourceError> {
        let html = self.get_text(ctx, &self.endpoints.latest_url).await?;
        parse_markup_draw(&html, &self.selectors)
    }

    async fn list_identifiers(
        &self,
        ctx: &FetchContext,
        page: u32,
    ) -> Result<Vec<DrawId>, SourceError> {
        let url = self.endpoints.listing_url.replace("{page}", &page.to_string());
        let html = self.get_text(ctx, &url).await?;
        parse_markup_listing(&html, &self.selectors)
    }

    async fn fetch_detail(&self, ctx: &FetchContext, id: &DrawId) -> Result<RawDraw, SourceError> {
        let url = self.endpoints.detail_url.replace("{id}", id.as_str());
        let html = self.get_text(ctx, &url).await?;
        parse_markup_draw(&html, &self.selectors)
    }

    fn recency_key(&self, id: &DrawId) -> Option<u32> {
        ddmmyyyy_recency_key(id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotto_core::validate;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture(source_id: &str, name: &str) -> Vec<u8> {
        let path = workspace_root().join("fixtures").join(source_id).join(name);
        fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn read_snapshot(source_id: &str) -> Vec<RawDraw> {
        serde_json::from_slice(&fixture(source_id, "snapshot.json")).expect("parse snapshot")
    }

    #[test]
    fn golden_json_snapshot_test_rayriffy_api() {
        let latest = parse_api_draw(&fixture("rayriffy-api", "latest.json")).unwrap();
        let detail = parse_api_draw(&fixture("rayriffy-api", "lotto_16062567.json")).unwrap();
        assert_eq!(vec![latest.clone(), detail], read_snapshot("rayriffy-api"));
        assert!(validate(&latest));
    }

    #[test]
    fn golden_json_snapshot_test_markup_pages() {
        let selectors = MarkupSelectors::default();
        let html = String::from_utf8(fixture("markup", "result.html")).unwrap();
        let draw = parse_markup_draw(&html, &selectors).unwrap();
        assert_eq!(vec![draw.clone()], read_snapshot("markup"));
        assert!(validate(&draw));
    }

    #[test]
    fn pending_api_payload_parses_but_fails_validation() {
        let raw = parse_api_draw(&fixture("rayriffy-api", "latest_pending.json")).unwrap();
        assert_eq!(raw.draw_date.as_deref(), Some("16 กรกฎาคม 2567"));
        assert_eq!(raw.front_three.as_deref(), Some("xxx, xxx"));
        assert!(!validate(&raw));
    }

    #[test]
    fn api_listing_keeps_source_order() {
        let ids = parse_api_listing(&fixture("rayriffy-api", "list_1.json")).unwrap();
        let ids: Vec<_> = ids.iter().map(DrawId::as_str).collect();
        assert_eq!(ids, vec!["01072567", "16062567", "01062567", "16052567", "02052567"]);
    }

    #[test]
    fn api_error_envelope_is_an_upstream_error() {
        let err = parse_api_draw(br#"{"status":"error","response":null}"#).unwrap_err();
        assert!(matches!(err, SourceError::Upstream { status } if status == "error"));
        let err = parse_api_listing(b"<html>").unwrap_err();
        assert!(matches!(err, SourceError::Malformed(_)));
    }

    #[test]
    fn api_draw_without_prize_first_id_falls_back_to_first_prize_entry() {
        let body = r#"{"status":"success","response":{
            "date":"1 มีนาคม 2567",
            "prizes":[{"id":"prize1","number":["654321"]}],
            "runningNumbers":[{"id":"runningNumberBackTwo","number":["07"]}]
        }}"#;
        let raw = parse_api_draw(body.as_bytes()).unwrap();
        assert_eq!(raw.draw_date.as_deref(), Some("1 มีนาคม 2567"));
        assert_eq!(raw.first_prize.as_deref(), Some("654321"));
        assert_eq!(raw.back_two.as_deref(), Some("07"));
        assert_eq!(raw.front_three, None);
        assert_eq!(raw.back_three, None);
    }

    #[test]
    fn markup_listing_extracts_last_path_segment_once() {
        let html = String::from_utf8(fixture("markup", "listing.html")).unwrap();
        let ids = parse_markup_listing(&html, &MarkupSelectors::default()).unwrap();
        let ids: Vec<_> = ids.iter().map(DrawId::as_str).collect();
        assert_eq!(ids, vec!["01072567", "16062567", "01062567"]);
    }

    #[test]
    fn bad_selector_is_reported_not_panicked() {
        let selectors = MarkupSelectors {
            date: "[[".to_string(),
            ..MarkupSelectors::default()
        };
        assert!(matches!(
            parse_markup_draw("<p></p>", &selectors),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn recency_key_decodes_trailing_ddmmyyyy() {
        assert_eq!(ddmmyyyy_recency_key("01072567"), Some(25670701));
        assert_eq!(ddmmyyyy_recency_key("lotto-16062567"), Some(25670616));
        assert_eq!(ddmmyyyy_recency_key("99132567"), None);
        assert_eq!(ddmmyyyy_recency_key("abc"), None);
        assert!(ddmmyyyy_recency_key("01072567") > ddmmyyyy_recency_key("16062567"));
        assert!(ddmmyyyy_recency_key("02012568") > ddmmyyyy_recency_key("30122567"));
    }
}
