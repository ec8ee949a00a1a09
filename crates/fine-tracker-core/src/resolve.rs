//! Header-map resolution: raw detail-panel labels to canonical fields.
//!
//! The listing table's column headers vary in punctuation, casing and the
//! literal euro sign, and the responsive child row repeats fields under
//! slightly different titles. Resolution therefore goes through an alias
//! table over normalized labels instead of column positions.

use std::collections::BTreeMap;

use crate::FineError;

/// Canonical record fields a raw label can resolve to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum CanonicalField {
    ExternalId,
    Country,
    Authority,
    DecisionDate,
    AmountEur,
    Party,
    CitedArticles,
    Category,
    Summary,
    SourceUrl,
    CanonicalUrl,
}

impl CanonicalField {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExternalId => "external_id",
            Self::Country => "country",
            Self::Authority => "authority",
            Self::DecisionDate => "decision_date",
            Self::AmountEur => "amount_eur",
            Self::Party => "party",
            Self::CitedArticles => "cited_articles",
            Self::Category => "category",
            Self::Summary => "summary",
            Self::SourceUrl => "source_url",
            Self::CanonicalUrl => "canonical_url",
        }
    }

    /// Parses the snake_case field name used in stored rows and reports.
    ///
    /// # Errors
    /// Returns [`FineError::Validation`] for an unknown name.
    pub fn parse(value: &str) -> Result<Self, FineError> {
        match value {
            "external_id" => Ok(Self::ExternalId),
            "country" => Ok(Self::Country),
            "authority" => Ok(Self::Authority),
            "decision_date" => Ok(Self::DecisionDate),
            "amount_eur" => Ok(Self::AmountEur),
            "party" => Ok(Self::Party),
            "cited_articles" => Ok(Self::CitedArticles),
            "category" => Ok(Self::Category),
            "summary" => Ok(Self::Summary),
            "source_url" => Ok(Self::SourceUrl),
            "canonical_url" => Ok(Self::CanonicalUrl),
            other => Err(FineError::Validation(format!(
                "unknown canonical field: {other}"
            ))),
        }
    }
}

/// Alias fragments matched against normalized labels, most specific first.
///
/// Matching is substring-based, so "fine" catches "Fine [€]" and
/// "fine amount" alike. Order matters where fragments overlap:
/// "direct url" must win before the bare "url" in a source label would.
const FIELD_ALIASES: &[(CanonicalField, &[&str])] = &[
    (CanonicalField::ExternalId, &["etid"]),
    (CanonicalField::CanonicalUrl, &["direct url", "permalink"]),
    (CanonicalField::SourceUrl, &["source"]),
    (CanonicalField::Country, &["country"]),
    (CanonicalField::Authority, &["authority"]),
    (
        CanonicalField::DecisionDate,
        &["date of decision", "decision date", "date"],
    ),
    (CanonicalField::AmountEur, &["fine"]),
    (
        CanonicalField::Party,
        &["controller/processor", "controller", "processor", "party"],
    ),
    (CanonicalField::CitedArticles, &["quoted art", "article"]),
    (CanonicalField::Category, &["type"]),
    (CanonicalField::Summary, &["summary"]),
];

/// Normalizes a raw header label for alias matching.
///
/// Lowercases, folds the euro sign to `e`, keeps `/` (it distinguishes
/// "controller/processor"), maps every other non-alphanumeric rune to a
/// space and collapses runs of whitespace.
#[must_use]
pub fn normalize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch == '\u{20ac}' {
            out.push('e');
        } else if ch.is_alphanumeric() || ch == '/' {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            out.push(' ');
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn resolve_label(raw_label: &str) -> Option<CanonicalField> {
    let normalized = normalize_label(raw_label);
    if normalized.is_empty() {
        return None;
    }
    for (field, aliases) in FIELD_ALIASES {
        if aliases.iter().any(|alias| normalized.contains(alias)) {
            return Some(*field);
        }
    }
    None
}

/// Resolves raw `(label, value)` pairs to canonical fields.
///
/// Pairs with unknown labels or empty values are dropped; the first
/// non-empty value per canonical field wins, so main-row cells take
/// precedence over child-row repeats when both carry data.
#[must_use]
pub fn resolve_fields(pairs: &[(String, String)]) -> BTreeMap<CanonicalField, String> {
    let mut resolved = BTreeMap::new();
    for (label, value) in pairs {
        if value.trim().is_empty() {
            continue;
        }
        if let Some(field) = resolve_label(label) {
            resolved.entry(field).or_insert_with(|| value.clone());
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(label, value)| ((*label).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn labels_normalize_case_punctuation_and_euro_sign() {
        assert_eq!(normalize_label("Fine [€]"), "fine e");
        assert_eq!(normalize_label("  Date  of\tDecision "), "date of decision");
        assert_eq!(
            normalize_label("Controller/Processor"),
            "controller/processor"
        );
        assert_eq!(normalize_label("Quoted Art."), "quoted art");
    }

    #[test]
    fn aliases_match_label_variants() {
        assert_eq!(resolve_label("ETid"), Some(CanonicalField::ExternalId));
        assert_eq!(resolve_label("Fine [€]"), Some(CanonicalField::AmountEur));
        assert_eq!(
            resolve_label("Fine amount in EUR"),
            Some(CanonicalField::AmountEur)
        );
        assert_eq!(
            resolve_label("Date of Decision"),
            Some(CanonicalField::DecisionDate)
        );
        assert_eq!(
            resolve_label("Quoted Art."),
            Some(CanonicalField::CitedArticles)
        );
        assert_eq!(
            resolve_label("Direct URL"),
            Some(CanonicalField::CanonicalUrl)
        );
        assert_eq!(resolve_label("Source"), Some(CanonicalField::SourceUrl));
        assert_eq!(resolve_label("Completely Novel Column"), None);
    }

    #[test]
    fn resolution_is_order_independent_and_ignores_unknowns() {
        let shuffled = pairs(&[
            ("Type", "Non-compliance"),
            ("Mystery Column", "noise"),
            ("ETid", "ETid-42"),
            ("Country", "Spain"),
        ]);
        let resolved = resolve_fields(&shuffled);
        assert_eq!(
            resolved.get(&CanonicalField::ExternalId).map(String::as_str),
            Some("ETid-42")
        );
        assert_eq!(
            resolved.get(&CanonicalField::Category).map(String::as_str),
            Some("Non-compliance")
        );
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn first_non_empty_value_wins() {
        let repeated = pairs(&[
            ("Fine [€]", ""),
            ("Fine [€]", "9,000"),
            ("Fine", "override attempt"),
        ]);
        let resolved = resolve_fields(&repeated);
        assert_eq!(
            resolved.get(&CanonicalField::AmountEur).map(String::as_str),
            Some("9,000")
        );
    }

    #[test]
    fn field_names_round_trip() {
        let all = [
            CanonicalField::ExternalId,
            CanonicalField::Country,
            CanonicalField::Authority,
            CanonicalField::DecisionDate,
            CanonicalField::AmountEur,
            CanonicalField::Party,
            CanonicalField::CitedArticles,
            CanonicalField::Category,
            CanonicalField::Summary,
            CanonicalField::SourceUrl,
            CanonicalField::CanonicalUrl,
        ];
        for field in all {
            assert_eq!(CanonicalField::parse(field.as_str()), Ok(field));
        }
        assert!(CanonicalField::parse("bogus").is_err());
    }
}
