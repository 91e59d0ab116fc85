//! Core draw model: raw/complete draw records, completeness validation and the
//! bounded newest-first history.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lotto-core";

/// Placeholder values upstream sources publish before a draw is finalized.
/// Compared after trimming and ASCII lower-casing; the empty string is also a sentinel.
pub const SENTINELS: [&str; 6] = ["n/a", "nan", "null", "x", "xx", "xxx"];

pub fn is_sentinel(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    normalized.is_empty() || SENTINELS.contains(&normalized.as_str())
}

/// A field value is unpublished if it, or any part of a joined `"123, 456"`
/// display string, is a sentinel.
pub fn is_placeholder(value: &str) -> bool {
    is_sentinel(value) || value.split(',').any(is_sentinel)
}

/// Opaque identifier of one historical draw, as listed by a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DrawId(String);

impl DrawId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DrawId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The five semantic fields of a draw, named as they appear in the archive file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DrawField {
    Date,
    FirstPrize,
    FrontThree,
    BackThree,
    BackTwo,
}

impl DrawField {
    pub const ALL: [DrawField; 5] = [
        DrawField::Date,
        DrawField::FirstPrize,
        DrawField::FrontThree,
        DrawField::BackThree,
        DrawField::BackTwo,
    ];

    pub fn archive_name(self) -> &'static str {
        match self {
            DrawField::Date => "date",
            DrawField::FirstPrize => "number",
            DrawField::FrontThree => "top3",
            DrawField::BackThree => "bottom3",
            DrawField::BackTwo => "bottom2",
        }
    }
}

impl fmt::Display for DrawField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.archive_name())
    }
}

/// Draw as handed over by a source, before completeness has been checked.
/// `None` means the source did not publish the field at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDraw {
    pub draw_date: Option<String>,
    pub first_prize: Option<String>,
    pub front_three: Option<String>,
    pub back_three: Option<String>,
    pub back_two: Option<String>,
}

impl RawDraw {
    /// Raw draw with every field present.
    pub fn new(
        draw_date: impl Into<String>,
        first_prize: impl Into<String>,
        front_three: impl Into<String>,
        back_three: impl Into<String>,
        back_two: impl Into<String>,
    ) -> Self {
        Self {
            draw_date: Some(draw_date.into()),
            first_prize: Some(first_prize.into()),
            front_three: Some(front_three.into()),
            back_three: Some(back_three.into()),
            back_two: Some(back_two.into()),
        }
    }

    pub fn field(&self, field: DrawField) -> Option<&str> {
        match field {
            DrawField::Date => self.draw_date.as_deref(),
            DrawField::FirstPrize => self.first_prize.as_deref(),
            DrawField::FrontThree => self.front_three.as_deref(),
            DrawField::BackThree => self.back_three.as_deref(),
            DrawField::BackTwo => self.back_two.as_deref(),
        }
    }

    /// Fields that are missing or hold a sentinel, in canonical order.
    pub fn pending_fields(&self) -> Vec<DrawField> {
        DrawField::ALL
            .into_iter()
            .filter(|f| self.field(*f).map_or(true, is_placeholder))
            .collect()
    }
}

/// True iff all five fields carry published, non-placeholder values.
pub fn validate(record: &RawDraw) -> bool {
    DrawField::ALL
        .into_iter()
        .all(|f| record.field(f).is_some_and(|v| !is_placeholder(v)))
}

/// A draw that failed validation; the expected state while results are being finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDraw {
    pub draw_date: Option<String>,
    pub fields: Vec<DrawField>,
}

impl fmt::Display for PendingDraw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self
            .fields
            .iter()
            .map(|f| f.archive_name())
            .collect::<Vec<_>>()
            .join(", ");
        write!(
            f,
            "draw {} pending (fields: {fields})",
            self.draw_date.as_deref().unwrap_or("<undated>")
        )
    }
}

/// One complete published draw. Field names follow the archive file layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawRecord {
    #[serde(rename = "date")]
    draw_date: String,
    #[serde(rename = "number")]
    first_prize: String,
    #[serde(rename = "top3")]
    front_three: String,
    #[serde(rename = "bottom3")]
    back_three: String,
    #[serde(rename = "bottom2")]
    back_two: String,
}

impl DrawRecord {
    pub fn from_raw(raw: RawDraw) -> Result<Self, PendingDraw> {
        let pending = raw.pending_fields();
        if !pending.is_empty() {
            return Err(PendingDraw {
                draw_date: raw.draw_date,
                fields: pending,
            });
        }
        match raw {
            RawDraw {
                draw_date: Some(draw_date),
                first_prize: Some(first_prize),
                front_three: Some(front_three),
                back_three: Some(back_three),
                back_two: Some(back_two),
            } => Ok(Self {
                draw_date,
                first_prize,
                front_three,
                back_three,
                back_two,
            }),
            raw => Err(PendingDraw {
                draw_date: raw.draw_date,
                fields: Vec::new(),
            }),
        }
    }

    pub fn draw_date(&self) -> &str {
        &self.draw_date
    }

    pub fn first_prize(&self) -> &str {
        &self.first_prize
    }

    pub fn front_three(&self) -> &str {
        &self.front_three
    }

    pub fn back_three(&self) -> &str {
        &self.back_three
    }

    pub fn back_two(&self) -> &str {
        &self.back_two
    }

    /// Records read back from disk bypass `from_raw`, so loading re-checks this.
    pub fn is_complete(&self) -> bool {
        validate(&self.to_raw())
    }

    pub fn to_raw(&self) -> RawDraw {
        RawDraw::new(
            self.draw_date.clone(),
            self.first_prize.clone(),
            self.front_three.clone(),
            self.back_three.clone(),
            self.back_two.clone(),
        )
    }
}

/// Derived once per run from the persisted history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub existing_history_length: usize,
    pub existing_latest_date: Option<String>,
}

/// Newest-first draw history, unique by draw date.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct History {
    entries: Vec<DrawRecord>,
}

/// Result of building a history from untrusted records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sanitized {
    pub history: History,
    pub dropped_incomplete: usize,
    pub dropped_duplicates: usize,
}

impl Sanitized {
    pub fn dropped(&self) -> usize {
        self.dropped_incomplete + self.dropped_duplicates
    }
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the given order, dropping incomplete records and any later record
    /// whose draw date was already seen.
    pub fn from_records(records: impl IntoIterator<Item = DrawRecord>) -> Sanitized {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut dropped_incomplete = 0;
        let mut dropped_duplicates = 0;
        for record in records {
            if !record.is_complete() {
                dropped_incomplete += 1;
                continue;
            }
            if !seen.insert(record.draw_date.clone()) {
                dropped_duplicates += 1;
                continue;
            }
            entries.push(record);
        }
        Sanitized {
            history: History { entries },
            dropped_incomplete,
            dropped_duplicates,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<&DrawRecord> {
        self.entries.first()
    }

    pub fn head_date(&self) -> Option<&str> {
        self.head().map(DrawRecord::draw_date)
    }

    pub fn entries(&self) -> &[DrawRecord] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &DrawRecord> {
        self.entries.iter()
    }

    pub fn contains_date(&self, draw_date: &str) -> bool {
        self.entries.iter().any(|r| r.draw_date == draw_date)
    }

    pub fn into_entries(self) -> Vec<DrawRecord> {
        self.entries
    }

    pub fn truncated(mut self, limit: usize) -> Self {
        self.entries.truncate(limit);
        self
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            existing_history_length: self.len(),
            existing_latest_date: self.head_date().map(ToString::to_string),
        }
    }
}

/// Inserts `new_record` at the head and trims the tail to `retention_limit`
/// entries. If the draw date is already present, `existing` comes back as-is.
pub fn merge(existing: History, new_record: DrawRecord, retention_limit: usize) -> History {
    if existing.contains_date(&new_record.draw_date) {
        return existing;
    }
    let mut entries = Vec::with_capacity(existing.len() + 1);
    entries.push(new_record);
    entries.extend(existing.entries);
    History { entries }.truncated(retention_limit)
}

/// Lays the newest-first `fetched` records over `existing`: the records listed
/// before the first date `existing` already holds become its new head, the
/// rest of `fetched` is ignored. Trimmed to `retention_limit`.
pub fn overlay(fetched: History, existing: History, retention_limit: usize) -> History {
    let newer: Vec<DrawRecord> = fetched
        .entries
        .into_iter()
        .take_while(|r| !existing.contains_date(&r.draw_date))
        .collect();
    if newer.is_empty() {
        return existing;
    }
    let mut entries = newer;
    entries.extend(existing.entries);
    History { entries }.truncated(retention_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(date: &str) -> DrawRecord {
        DrawRecord::from_raw(RawDraw::new(date, "123456", "123, 456", "789, 012", "34")).unwrap()
    }

    fn history(dates: &[&str]) -> History {
        History::from_records(dates.iter().map(|d| record(d))).history
    }

    #[test]
    fn sentinels_are_case_and_whitespace_insensitive() {
        for value in ["", "  ", "N/A", "n/a", "NaN", "NULL", "x", "X", "XX", " xxx "] {
            assert!(is_sentinel(value), "{value:?} should be a sentinel");
        }
        for value in ["123456", "123, 456", "xxxx", "0", "1 กรกฎาคม 2567"] {
            assert!(!is_sentinel(value), "{value:?} should not be a sentinel");
        }
    }

    #[test]
    fn validate_rejects_any_placeholder_field() {
        let complete = RawDraw::new("1 กรกฎาคม 2567", "123456", "123, 456", "789, 012", "34");
        assert!(validate(&complete));

        for field in DrawField::ALL {
            for placeholder in [None, Some(""), Some("N/A"), Some("x"), Some("XX")] {
                let mut raw = complete.clone();
                let slot = match field {
                    DrawField::Date => &mut raw.draw_date,
                    DrawField::FirstPrize => &mut raw.first_prize,
                    DrawField::FrontThree => &mut raw.front_three,
                    DrawField::BackThree => &mut raw.back_three,
                    DrawField::BackTwo => &mut raw.back_two,
                };
                *slot = placeholder.map(ToString::to_string);
                assert!(!validate(&raw), "{field} = {placeholder:?} should fail");
                assert_eq!(raw.pending_fields(), vec![field]);
            }
        }
    }

    #[test]
    fn joined_placeholder_parts_mark_the_field_pending() {
        assert!(is_placeholder("xxx, xxx"));
        assert!(is_placeholder("123, XXX"));
        assert!(is_placeholder("123,"));
        assert!(!is_placeholder("123, 456"));

        let raw = RawDraw::new("2024-07-01", "123456", "xxx, xxx", "789, 012", "34");
        assert!(!validate(&raw));
        assert_eq!(raw.pending_fields(), vec![DrawField::FrontThree]);
    }

    #[test]
    fn from_raw_reports_pending_fields() {
        let raw = RawDraw {
            back_two: Some("xx".into()),
            ..RawDraw::new("2024-07-01", "123456", "123, 456", "789, 012", "34")
        };
        let pending = DrawRecord::from_raw(raw).unwrap_err();
        assert_eq!(pending.draw_date.as_deref(), Some("2024-07-01"));
        assert_eq!(pending.fields, vec![DrawField::BackTwo]);
        assert_eq!(pending.to_string(), "draw 2024-07-01 pending (fields: bottom2)");
    }

    #[test]
    fn record_serializes_with_archive_field_names() {
        let json = serde_json::to_value(record("2024-07-01")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "date": "2024-07-01",
                "number": "123456",
                "top3": "123, 456",
                "bottom3": "789, 012",
                "bottom2": "34",
            })
        );
    }

    #[test]
    fn from_records_drops_incomplete_and_duplicate_dates() {
        let incomplete: DrawRecord = serde_json::from_value(serde_json::json!({
            "date": "2024-06-01", "number": "N/A", "top3": "1", "bottom3": "2", "bottom2": "3"
        }))
        .unwrap();
        let sanitized = History::from_records(vec![
            record("2024-07-01"),
            incomplete,
            record("2024-06-16"),
            record("2024-07-01"),
        ]);
        assert_eq!(sanitized.dropped_incomplete, 1);
        assert_eq!(sanitized.dropped_duplicates, 1);
        assert_eq!(sanitized.history.head_date(), Some("2024-07-01"));
        assert_eq!(sanitized.history.len(), 2);
    }

    #[test]
    fn merge_prepends_new_draw_and_keeps_old_head_second() {
        let existing = history(&["2024-06-16", "2024-06-01"]);
        let merged = merge(existing, record("2024-07-01"), 100);
        let dates: Vec<_> = merged.iter().map(DrawRecord::draw_date).collect();
        assert_eq!(dates, vec!["2024-07-01", "2024-06-16", "2024-06-01"]);
    }

    #[test]
    fn merge_is_a_noop_when_head_matches() {
        let existing = history(&["2024-07-01", "2024-06-16"]);
        let merged = merge(existing.clone(), record("2024-07-01"), 100);
        assert_eq!(merged, existing);
    }

    #[test]
    fn merge_ignores_a_stale_draw_already_below_the_head() {
        let existing = history(&["2024-07-01", "2024-06-16"]);
        let merged = merge(existing.clone(), record("2024-06-16"), 100);
        assert_eq!(merged, existing);
    }

    #[test]
    fn merge_of_known_date_returns_existing_even_above_limit() {
        let existing = history(&["c", "b", "a"]);
        let merged = merge(existing.clone(), record("b"), 2);
        assert_eq!(merged, existing);
    }

    #[test]
    fn overlay_prepends_only_draws_newer_than_existing_head() {
        let fetched = history(&["e", "d", "c", "x"]);
        let existing = history(&["c", "b", "a"]);
        let dates: Vec<_> = overlay(fetched, existing, 100)
            .iter()
            .map(|r| r.draw_date().to_string())
            .collect();
        assert_eq!(dates, vec!["e", "d", "c", "b", "a"]);
    }

    #[test]
    fn overlay_without_newer_draws_keeps_existing() {
        let existing = history(&["c", "b", "a"]);
        assert_eq!(overlay(history(&["c", "b"]), existing.clone(), 2), existing);
        assert_eq!(overlay(History::new(), existing.clone(), 100), existing);
    }

    #[test]
    fn overlay_trims_to_retention_limit() {
        let merged = overlay(history(&["d"]), history(&["c", "b", "a"]), 3);
        assert_eq!(merged.head_date(), Some("d"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn merge_trims_tail_to_retention_limit() {
        let existing = history(&["c", "b", "a"]);
        let merged = merge(existing, record("d"), 3);
        let dates: Vec<_> = merged.iter().map(DrawRecord::draw_date).collect();
        assert_eq!(dates, vec!["d", "c", "b"]);
    }

    #[test]
    fn sync_state_reflects_head() {
        assert_eq!(History::new().sync_state(), SyncState::default());
        let state = history(&["b", "a"]).sync_state();
        assert_eq!(state.existing_history_length, 2);
        assert_eq!(state.existing_latest_date.as_deref(), Some("b"));
    }

    proptest! {
        #[test]
        fn prop_merge_never_duplicates_dates(
            dates in proptest::collection::vec(0u8..12, 0..64),
            limit in 1usize..20,
        ) {
            let mut h = History::new();
            for d in dates {
                h = merge(h, record(&format!("draw-{d}")), limit);
                let unique: HashSet<_> = h.iter().map(DrawRecord::draw_date).collect();
                prop_assert_eq!(unique.len(), h.len());
            }
        }

        #[test]
        fn prop_merge_respects_retention_limit(
            dates in proptest::collection::vec(0u16..500, 0..64),
            limit in 1usize..20,
        ) {
            let mut h = History::new();
            for d in dates {
                let fresh = !h.contains_date(&format!("draw-{d}"));
                h = merge(h, record(&format!("draw-{d}")), limit);
                prop_assert!(h.len() <= limit);
                if fresh {
                    let expected = format!("draw-{d}");
                    prop_assert_eq!(h.head_date(), Some(expected.as_str()));
                }
            }
        }
    }
}
