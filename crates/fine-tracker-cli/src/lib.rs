//! The `fines` command line: refresh the local database from the listing and
//! query what has been collected.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use fine_tracker_core::parse_iso_date;
use fine_tracker_scraper::{run_refresh, BrowserSession, ScrapeConfig};
use fine_tracker_store_sqlite::{FineQuery, SqliteFineStore};

#[derive(Debug, Parser)]
#[command(name = "fines")]
#[command(about = "GDPR enforcement fine tracker")]
pub struct Cli {
    #[arg(long, default_value = "./fines.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scrape the listing and upsert every row into the database.
    Refresh(RefreshArgs),
    /// Print one record by its external id.
    Show(ShowArgs),
    /// List records matching the given filters.
    List(ListArgs),
    /// Monthly counts and fine totals.
    Stats,
    /// Dump every record as line-delimited JSON.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct RefreshArgs {
    /// Stop after this many listing pages.
    #[arg(long)]
    max_pages: Option<usize>,
    /// Listing URL to scrape instead of the default.
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    external_id: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    authority: Option<String>,
    /// Substring match inside the cited articles.
    #[arg(long)]
    article: Option<String>,
    /// Substring match on the fined party.
    #[arg(long)]
    party: Option<String>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long)]
    min_amount: Option<f64>,
    #[arg(long)]
    max_amount: Option<f64>,
    /// Earliest decision date, YYYY-MM-DD.
    #[arg(long)]
    date_from: Option<String>,
    /// Latest decision date, YYYY-MM-DD.
    #[arg(long)]
    date_to: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    offset: Option<usize>,
    /// Emit full records as JSON instead of the one-line summary.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Write to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, the scrape
/// fails outright, or a filter argument cannot be parsed.
pub async fn run_cli(cli: Cli) -> Result<()> {
    let store = SqliteFineStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::Refresh(args) => run_refresh_command(args, &store).await,
        Command::Show(args) => {
            let record = store
                .get_record(&args.external_id)?
                .ok_or_else(|| anyhow!("no fine with external id {}", args.external_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::List(args) => run_list(args, &store),
        Command::Stats => {
            let stats = store.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Export(args) => {
            let jsonl = store.export_jsonl()?;
            match args.output {
                Some(path) => std::fs::write(&path, jsonl)
                    .with_context(|| format!("failed to write export to {}", path.display()))?,
                None => print!("{jsonl}"),
            }
            Ok(())
        }
    }
}

async fn run_refresh_command(args: RefreshArgs, store: &SqliteFineStore) -> Result<()> {
    let mut config = ScrapeConfig {
        max_pages: args.max_pages,
        ..ScrapeConfig::default()
    };
    if let Some(base_url) = args.base_url {
        config.base_url = base_url;
    }

    let mut session = BrowserSession::launch(&config)
        .await
        .context("failed to launch browser")?;
    let outcome = run_refresh(&mut session, store, &config).await;
    if let Err(err) = session.close().await {
        tracing::warn!(error = %err, "browser shutdown failed");
    }

    let report = outcome.map_err(anyhow::Error::from)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn run_list(args: ListArgs, store: &SqliteFineStore) -> Result<()> {
    let filter = build_query(&args)?;
    let records = store.query(&filter)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in records {
        let date = record
            .decision_date
            .map(|value| {
                fine_tracker_core::format_iso_date(value).map_err(|err| anyhow!(err.to_string()))
            })
            .transpose()?
            .unwrap_or_else(|| "----------".to_string());
        let amount = record
            .amount_eur
            .map_or_else(|| "-".to_string(), |value| format!("{value:.2}"));
        println!(
            "{}  {}  {:>14}  {}  {}",
            record.external_id,
            date,
            amount,
            record.country.as_deref().unwrap_or("-"),
            record.party.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn build_query(args: &ListArgs) -> Result<FineQuery> {
    let date_from = args
        .date_from
        .as_deref()
        .map(parse_iso_date)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))?;
    let date_to = args
        .date_to
        .as_deref()
        .map(parse_iso_date)
        .transpose()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(FineQuery {
        country: args.country.clone(),
        authority: args.authority.clone(),
        article: args.article.clone(),
        party: args.party.clone(),
        category: args.category.clone(),
        min_amount: args.min_amount,
        max_amount: args.max_amount,
        date_from,
        date_to,
        limit: args.limit,
        offset: args.offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn parse(args: &[&str]) -> Cli {
        match Cli::try_parse_from(args) {
            Ok(cli) => cli,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn list_filters_map_onto_the_query() {
        let cli = parse(&[
            "fines",
            "list",
            "--country",
            "Spain",
            "--article",
            "83(5)",
            "--min-amount",
            "1000",
            "--date-from",
            "2023-01-01",
            "--limit",
            "5",
        ]);

        let Command::List(args) = cli.command else {
            panic!("test failure: expected list command");
        };
        let query = must(build_query(&args));
        assert_eq!(query.country.as_deref(), Some("Spain"));
        assert_eq!(query.article.as_deref(), Some("83(5)"));
        assert_eq!(query.min_amount, Some(1000.0));
        assert!(query.date_from.is_some());
        assert_eq!(query.limit, Some(5));
        assert_eq!(query.offset, None);
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let cli = parse(&["fines", "list", "--date-from", "May 2023"]);
        let Command::List(args) = cli.command else {
            panic!("test failure: expected list command");
        };
        assert!(build_query(&args).is_err());
    }

    #[test]
    fn refresh_accepts_page_bound_and_base_url() {
        let cli = parse(&[
            "fines",
            "refresh",
            "--max-pages",
            "3",
            "--base-url",
            "https://listing.test/",
        ]);
        let Command::Refresh(args) = cli.command else {
            panic!("test failure: expected refresh command");
        };
        assert_eq!(args.max_pages, Some(3));
        assert_eq!(args.base_url.as_deref(), Some("https://listing.test/"));
    }

    #[test]
    fn a_subcommand_is_required() {
        let err = match Cli::try_parse_from(["fines"]) {
            Ok(_) => panic!("test failure: expected parse error"),
            Err(err) => err,
        };
        assert!(matches!(
            err.kind(),
            ErrorKind::MissingSubcommand
                | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        ));
    }
}
