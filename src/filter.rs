//! Filter state and its URL representation.
//!
//! Table filters map a column name to a predicate. The canonical encoding is
//! compact JSON with sorted keys and sorted, deduplicated set predicates; it is
//! percent-encoded into the `filters` URL parameter. Structurally equal filters
//! always produce identical encodings, which is what lets navigation be
//! suppressed when nothing changed.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use crate::error::ValidationError;

/// URL parameter carrying the encoded filter state.
pub const FILTERS_PARAM: &str = "filters";
/// URL parameter carrying the selected view.
pub const VIEW_PARAM: &str = "view";
/// URL parameter carrying the selected story.
pub const STORY_PARAM: &str = "story";
/// URL parameter carrying the 1-based page number.
pub const PAGE_PARAM: &str = "page";

/// A scalar operand of a predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    /// Boolean operand.
    Bool(bool),
    /// Integer operand.
    Int(i64),
    /// String operand.
    Text(String),
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// Named date ranges relative to "now".
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelativeRange {
    Today,
    Yesterday,
    Last7Days,
    Last30Days,
    ThisMonth,
    LastMonth,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    /// First day, inclusive.
    pub gte: NaiveDate,
    /// Last day, inclusive.
    pub lte: NaiveDate,
}

impl RelativeRange {
    /// Every supported token.
    pub const ALL: [Self; 6] = [
        Self::Today,
        Self::Yesterday,
        Self::Last7Days,
        Self::Last30Days,
        Self::ThisMonth,
        Self::LastMonth,
    ];

    /// The URL token for this range.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::Today => "today",
            Self::Yesterday => "yesterday",
            Self::Last7Days => "last_7_days",
            Self::Last30Days => "last_30_days",
            Self::ThisMonth => "this_month",
            Self::LastMonth => "last_month",
        }
    }

    /// Parse a URL token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.token() == token)
    }

    /// Resolve to concrete dates (UTC calendar) relative to `now`.
    pub fn resolve(self, now: DateTime<Utc>) -> Result<DateRange, ValidationError> {
        let today = now.date_naive();
        let range = match self {
            Self::Today => DateRange { gte: today, lte: today },
            Self::Yesterday => {
                let day = today - Duration::days(1);
                DateRange { gte: day, lte: day }
            }
            Self::Last7Days => DateRange {
                gte: today - Duration::days(6),
                lte: today,
            },
            Self::Last30Days => DateRange {
                gte: today - Duration::days(29),
                lte: today,
            },
            Self::ThisMonth => DateRange {
                gte: first_of_month(today.year(), today.month())?,
                lte: today,
            },
            Self::LastMonth => {
                let first_this = first_of_month(today.year(), today.month())?;
                let last_prev = first_this - Duration::days(1);
                DateRange {
                    gte: first_of_month(last_prev.year(), last_prev.month())?,
                    lte: last_prev,
                }
            }
        };
        Ok(range)
    }
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate, ValidationError> {
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(|| ValidationError::InvalidFilter {
        reason: format!("no first day for {year}-{month:02}"),
    })
}

/// A predicate over one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    /// Column equals the value.
    Eq(Scalar),
    /// Column equals one of the values.
    In(Vec<Scalar>),
    /// Array column shares at least one value.
    Overlaps(Vec<Scalar>),
    /// Bounded range; either bound may be open.
    Range {
        /// Lower bound, inclusive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gte: Option<Scalar>,
        /// Upper bound, inclusive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lte: Option<Scalar>,
    },
    /// Column is (or is not) null.
    IsNull(bool),
    /// Date column falls in a range resolved at request time.
    Within(RelativeRange),
}

impl Predicate {
    fn canonicalize(self) -> Self {
        match self {
            Self::In(values) => Self::In(sorted_set(values)),
            Self::Overlaps(values) => Self::Overlaps(sorted_set(values)),
            other => other,
        }
    }

    fn validate(&self, column: &str) -> Result<(), ValidationError> {
        match self {
            Self::In(values) | Self::Overlaps(values) if values.is_empty() => Err(ValidationError::InvalidFilter {
                reason: format!("{column}: empty value set"),
            }),
            Self::Range { gte: None, lte: None } => Err(ValidationError::InvalidFilter {
                reason: format!("{column}: range without bounds"),
            }),
            _ => Ok(()),
        }
    }

    fn to_variable(&self, now: DateTime<Utc>) -> Result<Json, ValidationError> {
        let value = match self {
            Self::Eq(v) => json!({ "eq": v }),
            Self::In(vs) => json!({ "in": vs }),
            Self::Overlaps(vs) => json!({ "overlaps": vs }),
            Self::Range { gte, lte } => {
                let mut obj = serde_json::Map::new();
                if let Some(gte) = gte {
                    obj.insert("gte".to_string(), json!(gte));
                }
                if let Some(lte) = lte {
                    obj.insert("lte".to_string(), json!(lte));
                }
                Json::Object(obj)
            }
            Self::IsNull(b) => json!({ "isNull": b }),
            Self::Within(range) => {
                let dates = range.resolve(now)?;
                json!({
                    "gte": dates.gte.format("%Y-%m-%d").to_string(),
                    "lte": dates.lte.format("%Y-%m-%d").to_string(),
                })
            }
        };
        Ok(value)
    }
}

fn sorted_set(mut values: Vec<Scalar>) -> Vec<Scalar> {
    values.sort();
    values.dedup();
    values
}

/// Column filters for a table view, always held in canonical form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    columns: BTreeMap<String, Predicate>,
}

impl FilterState {
    /// An empty filter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the predicate for `column`, replacing any previous one.
    pub fn insert(&mut self, column: impl Into<String>, predicate: Predicate) -> Result<(), ValidationError> {
        let column = column.into();
        if column.is_empty() {
            return Err(ValidationError::InvalidFilter {
                reason: "empty column name".to_string(),
            });
        }
        let predicate = predicate.canonicalize();
        predicate.validate(&column)?;
        self.columns.insert(column, predicate);
        Ok(())
    }

    /// Builder form of [`FilterState::insert`].
    pub fn with(mut self, column: impl Into<String>, predicate: Predicate) -> Result<Self, ValidationError> {
        self.insert(column, predicate)?;
        Ok(self)
    }

    /// Clear the predicate for `column`.
    pub fn remove(&mut self, column: &str) -> Option<Predicate> {
        self.columns.remove(column)
    }

    /// Predicate for `column`.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Predicate> {
        self.columns.get(column)
    }

    /// No column is filtered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Number of filtered columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Columns in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Predicate)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Canonical JSON text.
    #[must_use]
    pub fn to_json(&self) -> String {
        // A map of plain enums with string keys always serializes.
        serde_json::to_string(&self.columns).unwrap_or_default()
    }

    /// Parse and canonicalize JSON produced by [`FilterState::to_json`] or by hand.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let raw: BTreeMap<String, Predicate> =
            serde_json::from_str(text).map_err(|e| ValidationError::InvalidFilter { reason: e.to_string() })?;
        let mut state = Self::new();
        for (column, predicate) in raw {
            state.insert(column, predicate)?;
        }
        Ok(state)
    }

    /// Percent-encoded canonical form for the `filters` URL parameter.
    #[must_use]
    pub fn encode(&self) -> String {
        urlencoding::encode(&self.to_json()).into_owned()
    }

    /// Inverse of [`FilterState::encode`].
    pub fn decode(encoded: &str) -> Result<Self, ValidationError> {
        let text = urlencoding::decode(encoded).map_err(|e| ValidationError::InvalidFilter { reason: e.to_string() })?;
        Self::from_json(&text)
    }

    /// blake3 digest (hex) of the canonical encoding.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        blake3::hash(self.to_json().as_bytes()).to_hex().to_string()
    }

    /// Query variables with relative date ranges resolved against `now`.
    pub fn to_variables(&self, now: DateTime<Utc>) -> Result<Json, ValidationError> {
        let mut out = serde_json::Map::new();
        for (column, predicate) in &self.columns {
            out.insert(column.clone(), predicate.to_variable(now)?);
        }
        Ok(Json::Object(out))
    }
}

/// Table location as carried in the page URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlState {
    /// `filters` parameter.
    pub filters: FilterState,
    /// Saved view name.
    pub view: Option<String>,
    /// Story open in the side panel.
    pub story: Option<String>,
    /// 1-based table page.
    pub page: Option<u32>,
    /// Parameters this codec does not own, kept in their original order.
    pub extra: Vec<(String, String)>,
}

impl UrlState {
    /// Parse a query string, with or without the leading `?`.
    pub fn from_query_string(query: &str) -> Result<Self, ValidationError> {
        let mut state = Self::default();
        let query = query.strip_prefix('?').unwrap_or(query);

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (raw_key, raw_value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = percent_decode(raw_key)?;
            let value = percent_decode(raw_value)?;
            match key.as_str() {
                FILTERS_PARAM => state.filters = FilterState::from_json(&value)?,
                VIEW_PARAM => state.view = Some(value),
                STORY_PARAM => state.story = Some(value),
                PAGE_PARAM => {
                    let page = value.parse::<u32>().map_err(|_| ValidationError::InvalidFilter {
                        reason: format!("page is not a number: {value}"),
                    })?;
                    state.page = Some(page);
                }
                _ => state.extra.push((key, value)),
            }
        }
        Ok(state)
    }

    /// Canonical query string (without `?`). Empty state yields an empty string.
    #[must_use]
    pub fn to_query_string(&self) -> String {
        let mut parts = Vec::new();
        if !self.filters.is_empty() {
            parts.push(format!("{FILTERS_PARAM}={}", self.filters.encode()));
        }
        if let Some(view) = &self.view {
            parts.push(format!("{VIEW_PARAM}={}", urlencoding::encode(view)));
        }
        if let Some(story) = &self.story {
            parts.push(format!("{STORY_PARAM}={}", urlencoding::encode(story)));
        }
        if let Some(page) = self.page {
            parts.push(format!("{PAGE_PARAM}={page}"));
        }
        for (key, value) in &self.extra {
            parts.push(format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)));
        }
        parts.join("&")
    }

    /// Whether moving to this state from `current_query` changes the URL.
    #[must_use]
    pub fn navigation_needed(&self, current_query: &str) -> bool {
        match Self::from_query_string(current_query) {
            Ok(current) => current.to_query_string() != self.to_query_string(),
            Err(_) => true,
        }
    }
}

fn percent_decode(raw: &str) -> Result<String, ValidationError> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(std::borrow::Cow::into_owned)
        .map_err(|e| ValidationError::InvalidFilter { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_set_predicates_are_canonical() {
        let a = FilterState::new()
            .with("status", Predicate::In(vec!["open".into(), "closed".into(), "open".into()]))
            .unwrap();
        let b = FilterState::new()
            .with("status", Predicate::In(vec!["closed".into(), "open".into()]))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_json_shape() {
        let f = FilterState::new()
            .with("status", Predicate::Eq("open".into()))
            .unwrap()
            .with("assignee", Predicate::IsNull(true))
            .unwrap()
            .with("created", Predicate::Within(RelativeRange::Last7Days))
            .unwrap();
        assert_eq!(
            f.to_json(),
            r#"{"assignee":{"isNull":true},"created":{"within":"last_7_days"},"status":{"eq":"open"}}"#
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(FilterState::decode("%7Bnot json").is_err());
        assert!(FilterState::from_json(r#"{"x":{"in":[]}}"#).is_err());
        assert!(FilterState::from_json(r#"{"x":{"range":{}}}"#).is_err());
        assert!(FilterState::new().with("", Predicate::IsNull(false)).is_err());
    }

    #[test]
    fn test_relative_ranges() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        assert_eq!(
            RelativeRange::Yesterday.resolve(now).unwrap(),
            DateRange { gte: date(2024, 3, 9), lte: date(2024, 3, 9) }
        );
        assert_eq!(
            RelativeRange::Last7Days.resolve(now).unwrap(),
            DateRange { gte: date(2024, 3, 4), lte: date(2024, 3, 10) }
        );
        assert_eq!(
            RelativeRange::ThisMonth.resolve(now).unwrap(),
            DateRange { gte: date(2024, 3, 1), lte: date(2024, 3, 10) }
        );
        assert_eq!(
            RelativeRange::LastMonth.resolve(now).unwrap(),
            DateRange { gte: date(2024, 2, 1), lte: date(2024, 2, 29) }
        );

        let january = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            RelativeRange::LastMonth.resolve(january).unwrap(),
            DateRange { gte: date(2023, 12, 1), lte: date(2023, 12, 31) }
        );
    }

    #[test]
    fn test_tokens_round_trip() {
        for range in RelativeRange::ALL {
            assert_eq!(RelativeRange::from_token(range.token()), Some(range));
        }
        assert_eq!(RelativeRange::from_token("next_week"), None);
    }

    #[test]
    fn test_variables_resolve_relative_ranges() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 15, 0, 0).unwrap();
        let f = FilterState::new()
            .with("created", Predicate::Within(RelativeRange::Today))
            .unwrap()
            .with(
                "score",
                Predicate::Range {
                    gte: Some(Scalar::Int(3)),
                    lte: None,
                },
            )
            .unwrap();
        let vars = f.to_variables(now).unwrap();
        assert_eq!(vars["created"], json!({"gte": "2024-03-10", "lte": "2024-03-10"}));
        assert_eq!(vars["score"], json!({"gte": 3}));
    }

    #[test]
    fn test_url_state_round_trip_preserves_unknown_params() {
        let query = "utm_source=mail&view=table&filters=%7B%22status%22%3A%7B%22eq%22%3A%22open%22%7D%7D&page=2";
        let state = UrlState::from_query_string(query).unwrap();
        assert_eq!(state.view.as_deref(), Some("table"));
        assert_eq!(state.page, Some(2));
        assert_eq!(state.filters.get("status"), Some(&Predicate::Eq("open".into())));
        assert_eq!(state.extra, vec![("utm_source".to_string(), "mail".to_string())]);

        let again = UrlState::from_query_string(&state.to_query_string()).unwrap();
        assert_eq!(again, state);
    }

    #[test]
    fn test_navigation_suppressed_when_unchanged() {
        let state = UrlState {
            filters: FilterState::new()
                .with("tags", Predicate::Overlaps(vec!["b".into(), "a".into()]))
                .unwrap(),
            view: Some("table".to_string()),
            ..UrlState::default()
        };
        let current = state.to_query_string();
        assert!(!state.navigation_needed(&current));
        assert!(!state.navigation_needed(&format!("?{current}")));

        let mut moved = state.clone();
        moved.page = Some(3);
        assert!(moved.navigation_needed(&current));
        assert!(state.navigation_needed("page=oops"));
    }
}
