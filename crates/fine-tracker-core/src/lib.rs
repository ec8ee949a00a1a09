//! Domain types and pure field logic for scraped enforcement fines.
//!
//! Everything in this crate is I/O-free: the [`resolve`] module maps raw
//! detail-panel labels to canonical fields, the [`normalize`] module turns
//! raw strings into typed values, and [`build_record`] composes both into a
//! [`FineRecord`].

pub mod normalize;
pub mod resolve;

use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use crate::resolve::{resolve_fields, CanonicalField};

static ISO_DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FineError {
    #[error("missing external identifier")]
    MissingExternalId,
    #[error("validation error: {0}")]
    Validation(String),
}

/// One enforcement case, keyed by the source's stable external identifier.
///
/// Every field except `external_id` and `ingested_at` is optional: a field
/// that failed to parse is stored as `None`/empty rather than failing the
/// record. Re-ingesting the same id replaces the row wholesale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FineRecord {
    pub external_id: String,
    pub country: Option<String>,
    pub authority: Option<String>,
    #[serde(with = "iso_date")]
    pub decision_date: Option<Date>,
    pub amount_eur: Option<f64>,
    pub party: Option<String>,
    pub cited_articles: Vec<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub source_url: Option<String>,
    pub canonical_url: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub ingested_at: OffsetDateTime,
}

/// Builds a typed record from the raw label/value pairs of one listing row.
///
/// Runs the header-map resolver, then the per-field normalizers, and stamps
/// `ingested_at` with the current UTC time. Field-level parse failures
/// degrade to `None`/empty.
///
/// # Errors
/// Returns [`FineError::MissingExternalId`] when no usable external id is
/// present in the input pairs; this is the only hard failure for a row.
pub fn build_record(raw_pairs: &[(String, String)]) -> Result<FineRecord, FineError> {
    let fields = resolve_fields(raw_pairs);
    let text =
        |field: CanonicalField| fields.get(&field).and_then(|raw| normalize::clean_text(raw));

    let external_id = text(CanonicalField::ExternalId).ok_or(FineError::MissingExternalId)?;

    Ok(FineRecord {
        external_id,
        country: text(CanonicalField::Country),
        authority: text(CanonicalField::Authority),
        decision_date: fields
            .get(&CanonicalField::DecisionDate)
            .and_then(|raw| normalize::decision_date(raw)),
        amount_eur: fields
            .get(&CanonicalField::AmountEur)
            .and_then(|raw| normalize::amount_eur(raw)),
        party: text(CanonicalField::Party),
        cited_articles: fields
            .get(&CanonicalField::CitedArticles)
            .map(|raw| normalize::cited_articles(raw))
            .unwrap_or_default(),
        category: text(CanonicalField::Category),
        summary: text(CanonicalField::Summary),
        source_url: text(CanonicalField::SourceUrl),
        canonical_url: text(CanonicalField::CanonicalUrl),
        ingested_at: now_utc(),
    })
}

/// Parses an RFC 3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`FineError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, FineError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| FineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(FineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC 3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`FineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, FineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| FineError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`FineError::Validation`] when formatting fails.
pub fn format_iso_date(value: Date) -> Result<String, FineError> {
    value
        .format(&ISO_DATE_FORMAT)
        .map_err(|err| FineError::Validation(format!("failed to format date: {err}")))
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`FineError::Validation`] on any other shape.
pub fn parse_iso_date(value: &str) -> Result<Date, FineError> {
    Date::parse(value, &ISO_DATE_FORMAT)
        .map_err(|err| FineError::Validation(format!("invalid ISO date {value:?}: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S>(value: &Option<Date>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => {
                let formatted =
                    crate::format_iso_date(*date).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&formatted)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Date>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => crate::parse_iso_date(&raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(label, value)| ((*label).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn build_record_types_every_field() {
        let input = pairs(&[
            ("ETid", "ETid-2915"),
            ("Country", "Ireland"),
            ("Authority", "Data Protection Commission"),
            ("Date of Decision", "12 May 2023"),
            ("Fine [€]", "1,200,000"),
            ("Controller/Processor", "Example Ltd"),
            ("Quoted Art.", "Art. 5(1)(f), Art. 83(5)"),
            ("Type", "Insufficient technical measures"),
            ("Summary", "Unprotected backups."),
            ("Source", "https://example.org/decision"),
            ("Direct URL", "https://tracker.example/etid-2915"),
        ]);

        let record = must_ok(build_record(&input));
        assert_eq!(record.external_id, "ETid-2915");
        assert_eq!(record.country.as_deref(), Some("Ireland"));
        assert_eq!(
            record.authority.as_deref(),
            Some("Data Protection Commission")
        );
        assert_eq!(record.decision_date, Some(time::macros::date!(2023 - 05 - 12)));
        assert!(record.amount_eur.is_some_and(|v| (v - 1_200_000.0).abs() < 1e-9));
        assert_eq!(
            record.cited_articles,
            vec!["Art. 5(1)(f)".to_string(), "Art. 83(5)".to_string()]
        );
        assert_eq!(
            record.canonical_url.as_deref(),
            Some("https://tracker.example/etid-2915")
        );
    }

    #[test]
    fn build_record_degrades_unparseable_fields_to_null() {
        let input = pairs(&[
            ("ETid", "ETid-1"),
            ("Date of Decision", "unknown"),
            ("Fine [€]", "N/A"),
        ]);

        let record = must_ok(build_record(&input));
        assert_eq!(record.external_id, "ETid-1");
        assert_eq!(record.decision_date, None);
        assert_eq!(record.amount_eur, None);
        assert!(record.cited_articles.is_empty());
        assert_eq!(record.country, None);
    }

    #[test]
    fn build_record_requires_external_id() {
        let missing = pairs(&[("Country", "Spain")]);
        assert_eq!(build_record(&missing), Err(FineError::MissingExternalId));

        let blank = pairs(&[("ETid", "   "), ("Country", "Spain")]);
        assert_eq!(build_record(&blank), Err(FineError::MissingExternalId));
    }

    #[test]
    fn record_serializes_dates_as_iso_strings() {
        let input = pairs(&[("ETid", "ETid-7"), ("Date of Decision", "2023-05-12")]);
        let record = must_ok(build_record(&input));

        let value = must_ok(serde_json::to_value(&record));
        assert_eq!(value["decision_date"], json!("2023-05-12"));
        assert_eq!(value["external_id"], json!("ETid-7"));
        assert_eq!(value["cited_articles"], json!([]));

        let roundtrip: FineRecord = must_ok(serde_json::from_value(value));
        assert_eq!(roundtrip, record);
    }

    #[test]
    fn rfc3339_helpers_require_utc() {
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
    }
}
