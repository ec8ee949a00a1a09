#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! Sqlite persistence for enforcement fine records.
//!
//! One table keyed by the source's external id. Upserts replace the whole
//! row, so the newest scrape of an id always wins. The query surface mirrors
//! what downstream readers filter on: country, authority, cited article,
//! party, category, amount range and decision-date range.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fine_tracker_core::{
    format_iso_date, format_rfc3339, now_utc, parse_iso_date, parse_rfc3339_utc, FineRecord,
};
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite::types::Value as SqlValue;
use time::Date;
use tracing::debug;

const FINES_MIGRATION_VERSION: i64 = 1;
const DEFAULT_QUERY_LIMIT: usize = 100;

const SCHEMA_FINES_V1: &str = r"
CREATE TABLE IF NOT EXISTS fines (
  external_id TEXT PRIMARY KEY,
  country TEXT,
  authority TEXT,
  decision_date TEXT,
  amount_eur REAL CHECK (amount_eur >= 0.0 OR amount_eur IS NULL),
  party TEXT,
  cited_articles TEXT NOT NULL DEFAULT '[]',
  category TEXT,
  summary TEXT,
  source_url TEXT,
  canonical_url TEXT,
  ingested_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fines_country ON fines(country);
CREATE INDEX IF NOT EXISTS idx_fines_decision_date ON fines(decision_date);
CREATE INDEX IF NOT EXISTS idx_fines_amount ON fines(amount_eur);
";

const FINE_COLUMNS: &str = "external_id, country, authority, decision_date, amount_eur,
             party, cited_articles, category, summary, source_url, canonical_url, ingested_at";

pub struct SqliteFineStore {
    conn: Connection,
}

/// Filter set for [`SqliteFineStore::query`]; `None` predicates are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FineQuery {
    pub country: Option<String>,
    pub authority: Option<String>,
    /// Substring match inside the stored article list.
    pub article: Option<String>,
    /// Substring match on the fined party.
    pub party: Option<String>,
    pub category: Option<String>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub date_from: Option<Date>,
    pub date_to: Option<Date>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Per-month aggregate over decision dates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MonthlyStat {
    pub month: String,
    pub fines: usize,
    pub total_eur: f64,
}

impl SqliteFineStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_FINES_V1)
            .context("failed to apply fines schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![FINES_MIGRATION_VERSION, now],
            )
            .context("failed to register fines schema migration")?;

        Ok(())
    }

    /// Inserts or wholly replaces the row for `record.external_id`.
    ///
    /// Every column takes the incoming value, including nulls: a field that
    /// disappeared from the source disappears from the stored row too.
    pub fn upsert_record(&self, record: &FineRecord) -> Result<()> {
        StoreView { conn: &self.conn }.upsert(record)
    }

    /// Upserts a batch inside one transaction.
    pub fn upsert_batch(&mut self, records: &[FineRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start upsert transaction")?;

        for record in records {
            let store = StoreView { conn: &tx };
            store.upsert(record)?;
        }

        tx.commit().context("failed to commit upsert transaction")?;
        debug!(count = records.len(), "upserted fine batch");
        Ok(records.len())
    }

    pub fn get_record(&self, external_id: &str) -> Result<Option<FineRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FINE_COLUMNS} FROM fines WHERE external_id = ?1"
        ))?;

        let row = stmt
            .query_row(params![external_id], parse_fine_row)
            .optional()?;

        Ok(row)
    }

    pub fn query(&self, filter: &FineQuery) -> Result<Vec<FineRecord>> {
        let mut sql = format!("SELECT {FINE_COLUMNS} FROM fines");
        let mut clauses: Vec<String> = Vec::new();
        let mut bindings: Vec<SqlValue> = Vec::new();

        if let Some(country) = &filter.country {
            bindings.push(SqlValue::Text(country.clone()));
            clauses.push(format!("country = ?{}", bindings.len()));
        }
        if let Some(authority) = &filter.authority {
            bindings.push(SqlValue::Text(authority.clone()));
            clauses.push(format!("authority = ?{}", bindings.len()));
        }
        if let Some(article) = &filter.article {
            bindings.push(SqlValue::Text(format!("%{article}%")));
            clauses.push(format!("cited_articles LIKE ?{}", bindings.len()));
        }
        if let Some(party) = &filter.party {
            bindings.push(SqlValue::Text(format!("%{party}%")));
            clauses.push(format!("party LIKE ?{}", bindings.len()));
        }
        if let Some(category) = &filter.category {
            bindings.push(SqlValue::Text(category.clone()));
            clauses.push(format!("category = ?{}", bindings.len()));
        }
        if let Some(min_amount) = filter.min_amount {
            bindings.push(SqlValue::Real(min_amount));
            clauses.push(format!("amount_eur >= ?{}", bindings.len()));
        }
        if let Some(max_amount) = filter.max_amount {
            bindings.push(SqlValue::Real(max_amount));
            clauses.push(format!("amount_eur <= ?{}", bindings.len()));
        }
        if let Some(date_from) = filter.date_from {
            let formatted = format_iso_date(date_from).map_err(|err| anyhow!(err.to_string()))?;
            bindings.push(SqlValue::Text(formatted));
            clauses.push(format!("decision_date >= ?{}", bindings.len()));
        }
        if let Some(date_to) = filter.date_to {
            let formatted = format_iso_date(date_to).map_err(|err| anyhow!(err.to_string()))?;
            bindings.push(SqlValue::Text(formatted));
            clauses.push(format!("decision_date <= ?{}", bindings.len()));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        sql.push_str(" ORDER BY decision_date DESC, external_id ASC");
        sql.push_str(" LIMIT ");
        sql.push_str(&filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT).to_string());
        if let Some(offset) = filter.offset {
            sql.push_str(" OFFSET ");
            sql.push_str(&offset.to_string());
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(bindings), parse_fine_row)?;
        collect_rows(rows)
    }

    pub fn count(&self) -> Result<usize> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM fines", [], |row| {
                row.get::<_, i64>(0)
            })
            .context("failed to count fines")?;
        usize::try_from(count).with_context(|| format!("invalid fine count: {count}"))
    }

    /// Monthly counts and totals over rows with a decision date.
    pub fn stats(&self) -> Result<Vec<MonthlyStat>> {
        let mut stmt = self.conn.prepare(
            "SELECT substr(decision_date, 1, 7) AS month,
                    COUNT(*),
                    COALESCE(SUM(amount_eur), 0.0)
             FROM fines
             WHERE decision_date IS NOT NULL
             GROUP BY month
             ORDER BY month DESC",
        )?;

        let rows = stmt.query_map([], |row| {
            let month: String = row.get(0)?;
            let fines_i64: i64 = row.get(1)?;
            let total_eur: f64 = row.get(2)?;
            let fines = usize::try_from(fines_i64).map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Integer,
                    Box::new(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("invalid monthly count: {fines_i64}"),
                    )),
                )
            })?;
            Ok(MonthlyStat {
                month,
                fines,
                total_eur,
            })
        })?;

        collect_rows(rows)
    }

    /// Serializes every row as line-delimited JSON, newest decision first.
    pub fn export_jsonl(&self) -> Result<String> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {FINE_COLUMNS} FROM fines
             ORDER BY decision_date DESC, external_id ASC"
        ))?;

        let rows = stmt.query_map([], parse_fine_row)?;
        let records = collect_rows(rows)?;

        let mut out = String::new();
        for record in &records {
            let line = serde_json::to_string(record)
                .with_context(|| format!("failed to serialize fine {}", record.external_id))?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

// Borrowed-connection view so upsert_record and upsert_batch share one
// statement body across Connection and Transaction.
struct StoreView<'a> {
    conn: &'a Connection,
}

impl StoreView<'_> {
    fn upsert(&self, record: &FineRecord) -> Result<()> {
        let cited_articles = serde_json::to_string(&record.cited_articles)
            .context("failed to serialize cited articles")?;
        let decision_date = record
            .decision_date
            .map(format_iso_date)
            .transpose()
            .map_err(|err| anyhow!(err.to_string()))?;
        let ingested_at =
            format_rfc3339(record.ingested_at).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO fines(
                    external_id, country, authority, decision_date, amount_eur,
                    party, cited_articles, category, summary, source_url, canonical_url,
                    ingested_at
                 ) VALUES (
                    ?1, ?2, ?3, ?4, ?5,
                    ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12
                 )
                 ON CONFLICT(external_id) DO UPDATE SET
                    country = excluded.country,
                    authority = excluded.authority,
                    decision_date = excluded.decision_date,
                    amount_eur = excluded.amount_eur,
                    party = excluded.party,
                    cited_articles = excluded.cited_articles,
                    category = excluded.category,
                    summary = excluded.summary,
                    source_url = excluded.source_url,
                    canonical_url = excluded.canonical_url,
                    ingested_at = excluded.ingested_at",
                params![
                    record.external_id,
                    record.country,
                    record.authority,
                    decision_date,
                    record.amount_eur,
                    record.party,
                    cited_articles,
                    record.category,
                    record.summary,
                    record.source_url,
                    record.canonical_url,
                    ingested_at,
                ],
            )
            .with_context(|| format!("failed to upsert fine {}", record.external_id))?;

        Ok(())
    }
}

fn parse_fine_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FineRecord> {
    let external_id: String = row.get(0)?;
    let decision_date_raw: Option<String> = row.get(3)?;
    let cited_articles_raw: String = row.get(6)?;
    let ingested_at_raw: String = row.get(11)?;

    let decision_date = decision_date_raw
        .as_deref()
        .map(parse_iso_date)
        .transpose()
        .map_err(|err| text_conversion_failure(3, err.to_string()))?;

    let cited_articles: Vec<String> = serde_json::from_str(&cited_articles_raw)
        .map_err(|err| text_conversion_failure(6, format!("invalid cited_articles JSON: {err}")))?;

    let ingested_at = parse_rfc3339_utc(&ingested_at_raw)
        .map_err(|err| text_conversion_failure(11, err.to_string()))?;

    Ok(FineRecord {
        external_id,
        country: row.get(1)?,
        authority: row.get(2)?,
        decision_date,
        amount_eur: row.get(4)?,
        party: row.get(5)?,
        cited_articles,
        category: row.get(7)?,
        summary: row.get(8)?,
        source_url: row.get(9)?,
        canonical_url: row.get(10)?,
        ingested_at,
    })
}

fn text_conversion_failure(column: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message,
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
