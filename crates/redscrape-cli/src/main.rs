use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use redscrape_core::config::parse_community_list;
use redscrape_core::{
    normalize_records, ConflictPolicy, DatabaseConfig, RedditConfig, ScraperDefaults, TimeWindow,
    POSTS_TABLE, POST_SCHEMA,
};
use redscrape_reddit::{FixturePostSource, PostSource, RedditClient};
use redscrape_storage::{
    fetch, get_posts_by_subreddit, ConnectionManager, ImportOptions, ImportReport, QueryParam,
    RowMap, TableName,
};
use redscrape_sync::{
    collect_posts, read_records_json, store_records, write_parquet_table, Collection,
    CollectRequest,
};
use tracing_subscriber::EnvFilter;

const DEFAULT_OUTPUT: &str = "reddit_posts.parquet";

#[derive(Debug, Parser)]
#[command(name = "redscrape")]
#[command(about = "Collect Reddit posts and import them into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect posts and save them to a local Parquet file
    Scrape {
        #[command(flatten)]
        collect: CollectArgs,
        #[arg(short, long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },
    /// Collect posts and import them into the database
    Store {
        #[command(flatten)]
        collect: CollectArgs,
        #[command(flatten)]
        import: ImportArgs,
    },
    /// Import a JSON array of records into the database
    Import {
        #[arg(short, long)]
        input: PathBuf,
        #[command(flatten)]
        import: ImportArgs,
    },
    /// Create the posts table and its indexes
    InitDb {
        #[arg(long, default_value = POSTS_TABLE)]
        table: String,
    },
    /// Print stored posts of one subreddit
    Posts {
        #[arg(short, long)]
        subreddit: String,
        #[arg(short, long, default_value_t = 10)]
        limit: i64,
        #[arg(long, default_value = POSTS_TABLE)]
        table: String,
    },
    /// Run a read query with $1, $2, ... placeholders and print rows as JSON
    Query {
        sql: String,
        #[arg(short, long = "param")]
        params: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct CollectArgs {
    /// Subreddit to collect from; repeat or comma-separate for several
    #[arg(short = 's', long = "subreddit")]
    subreddits: Vec<String>,
    /// Posts kept per subreddit
    #[arg(short, long)]
    limit: Option<usize>,
    /// Only keep posts from the last N thirty-day months
    #[arg(short, long, conflicts_with_all = ["since", "until"])]
    months: Option<u32>,
    /// Oldest creation time kept (RFC 3339, YYYY-MM-DD or epoch seconds)
    #[arg(long, value_parser = parse_time)]
    since: Option<DateTime<Utc>>,
    /// Newest creation time kept
    #[arg(long, value_parser = parse_time)]
    until: Option<DateTime<Utc>>,
    /// Serve posts from a JSON fixture instead of the live API
    #[arg(long)]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct ImportArgs {
    #[arg(long, default_value_t = ConflictPolicy::Ignore)]
    policy: ConflictPolicy,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long, default_value = POSTS_TABLE)]
    table: String,
}

fn parse_time(input: &str) -> Result<DateTime<Utc>, String> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    input
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or_else(|| format!("`{input}` is not RFC 3339, YYYY-MM-DD or epoch seconds"))
}

impl CollectArgs {
    fn request(&self, defaults: &ScraperDefaults) -> CollectRequest {
        let mut request = CollectRequest::from_defaults(defaults);
        let communities: Vec<String> = self
            .subreddits
            .iter()
            .flat_map(|s| parse_community_list(s))
            .collect();
        if !communities.is_empty() {
            request.communities = communities;
        }
        if let Some(limit) = self.limit {
            request.limit = limit;
        }
        let window = match self.months {
            Some(months) => TimeWindow::last_months(months, Utc::now()),
            None => TimeWindow::between(self.since, self.until),
        };
        request.with_window(window)
    }
}

impl ImportArgs {
    fn options(&self, defaults: &ScraperDefaults) -> ImportOptions {
        ImportOptions {
            policy: self.policy,
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
        }
    }

    fn table(&self) -> Result<TableName> {
        Ok(TableName::new(&self.table)?)
    }
}

async fn collect(args: &CollectArgs, defaults: &ScraperDefaults) -> Result<Collection> {
    let request = args.request(defaults);
    let source: Box<dyn PostSource> = match &args.fixture {
        Some(path) => Box::new(FixturePostSource::load(path)?),
        None => {
            let config = RedditConfig::from_env().context("reading Reddit API settings")?;
            Box::new(
                RedditClient::connect(&config)
                    .await
                    .context("connecting to the Reddit API")?,
            )
        }
    };

    let collection = collect_posts(source.as_ref(), &request).await;
    for outcome in collection.failures() {
        eprintln!(
            "r/{}: {}",
            outcome.community,
            outcome.error.as_deref().unwrap_or("failed")
        );
    }
    Ok(collection)
}

async fn open_db() -> Result<ConnectionManager> {
    let config = DatabaseConfig::from_env().context("reading database settings")?;
    let mut db = ConnectionManager::new(&config);
    if !db.connect().await {
        bail!(
            "could not connect to database {} at {}:{}",
            config.database,
            config.host,
            config.port
        );
    }
    Ok(db)
}

async fn import_into_db(
    records: &[redscrape_core::RawRecord],
    args: &ImportArgs,
    defaults: &ScraperDefaults,
) -> Result<ImportReport> {
    let table = args.table()?;
    let mut db = open_db().await?;
    if !db.ensure_schema(&table, &POST_SCHEMA).await {
        bail!("could not create table {table}");
    }
    let report = store_records(&mut db, &table, records, args.options(defaults)).await;
    db.disconnect().await;

    let Some(report) = report else {
        bail!("import into {table} failed");
    };
    println!("{report}");
    if !report.is_complete() {
        bail!(
            "{} of {} batches failed",
            report.batches_failed,
            report.batches_committed + report.batches_failed
        );
    }
    Ok(report)
}

fn print_post(row: &RowMap) {
    for (column, value) in row {
        match value.as_str() {
            Some(text) => println!("{column}: {text}"),
            None => println!("{column}: {value}"),
        }
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();
    let defaults = ScraperDefaults::from_env().context("reading scraper defaults")?;

    let command = cli.command.unwrap_or(Commands::Scrape {
        collect: CollectArgs::default(),
        output: PathBuf::from(DEFAULT_OUTPUT),
    });

    match command {
        Commands::Scrape { collect: args, output } => {
            let collection = collect(&args, &defaults).await?;
            let table = normalize_records(&collection.records, &POST_SCHEMA)
                .context("normalizing collected posts")?;
            let written = write_parquet_table(&output, &table)?;
            println!("Saved {written} posts to {}", output.display());
        }
        Commands::Store {
            collect: args,
            import,
        } => {
            let collection = collect(&args, &defaults).await?;
            import_into_db(&collection.records, &import, &defaults).await?;
        }
        Commands::Import { input, import } => {
            let records = read_records_json(&input)?;
            import_into_db(&records, &import, &defaults).await?;
        }
        Commands::InitDb { table } => {
            let table = TableName::new(&table)?;
            let mut db = open_db().await?;
            let created = db.ensure_schema(&table, &POST_SCHEMA).await;
            db.disconnect().await;
            if !created {
                bail!("could not create table {table}");
            }
            println!("Table {table} is ready");
        }
        Commands::Posts {
            subreddit,
            limit,
            table,
        } => {
            let table = TableName::new(&table)?;
            let mut db = open_db().await?;
            let rows = get_posts_by_subreddit(&mut db, &table, &subreddit, limit).await;
            db.disconnect().await;
            let Some(rows) = rows else {
                bail!("could not read posts for r/{subreddit}");
            };
            for row in &rows {
                print_post(row);
            }
            println!("{} posts from r/{subreddit}", rows.len());
        }
        Commands::Query { sql, params } => {
            let params: Vec<QueryParam> = params.iter().map(|p| QueryParam::parse_loose(p)).collect();
            let mut db = open_db().await?;
            let rows = fetch(&mut db, &sql, &params).await;
            db.disconnect().await;
            let Some(rows) = rows else {
                bail!("query failed");
            };
            for row in &rows {
                println!("{}", serde_json::to_string(row)?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arguments_accept_three_formats() {
        let expected = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(parse_time("2023-11-14T22:13:20Z").unwrap(), expected);
        assert_eq!(parse_time("1700000000").unwrap(), expected);
        assert_eq!(
            parse_time("2023-11-14").unwrap(),
            DateTime::from_timestamp(1_699_920_000, 0).unwrap()
        );
        assert!(parse_time("last tuesday").is_err());
    }

    #[test]
    fn collect_args_override_defaults() {
        let cli = Cli::parse_from([
            "redscrape", "store", "-s", "rust,r/programming", "-s", "golang", "--limit", "5",
            "--policy", "overwrite", "--batch-size", "50",
        ]);
        let Some(Commands::Store { collect, import }) = cli.command else {
            panic!("expected store command");
        };
        let defaults = ScraperDefaults::default();
        let request = collect.request(&defaults);
        assert_eq!(request.communities, vec!["rust", "programming", "golang"]);
        assert_eq!(request.limit, 5);
        assert_eq!(request.window, TimeWindow::unbounded());

        let options = import.options(&defaults);
        assert_eq!(options.policy, ConflictPolicy::Overwrite);
        assert_eq!(options.batch_size, 50);
        assert_eq!(import.table().unwrap().as_str(), POSTS_TABLE);
    }

    #[test]
    fn months_conflicts_with_explicit_bounds() {
        let result = Cli::try_parse_from([
            "redscrape", "scrape", "--months", "3", "--since", "2024-01-01",
        ]);
        assert!(result.is_err());

        let cli = Cli::try_parse_from(["redscrape", "scrape", "--months", "2"]).unwrap();
        let Some(Commands::Scrape { collect, output }) = cli.command else {
            panic!("expected scrape command");
        };
        assert_eq!(output, PathBuf::from(DEFAULT_OUTPUT));
        assert!(collect.request(&ScraperDefaults::default()).window.start.is_some());
    }

    #[test]
    fn no_subcommand_means_scrape() {
        let cli = Cli::parse_from(["redscrape"]);
        assert!(cli.command.is_none());
    }
}
