//! fundingsync CLI — fetch, inspect and clear cached funding history.
//!
//! Usage:
//! ```bash
//! # Walk the last 30 days, reusing whatever is cached
//! fundingsync fetch --wallet 0xabc --url https://api.example.com
//!
//! # Run the whole loading sequence (30d → 90d → 180d → 365d)
//! fundingsync load --wallet 0xabc
//!
//! # Inspect and clear the cache
//! fundingsync status --wallet 0xabc
//! fundingsync clear --wallet 0xabc
//! ```

mod config;
mod logging;

use std::env;
use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tracing::debug;

use fundingsync_core::{
    FetchEvent, FetchObserver, FundingError, FundingFetcher, FundingLoader, FundingRecord, LoadReport, Phase,
    ProgressPhase, RecordStore, SystemClock, Window,
};
use fundingsync_http::HttpFundingSource;
use fundingsync_storage::SqliteKvStore;

use config::CliConfig;
use logging::init_tracing;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "fetch" => cmd_fetch(rest).await,
        "extended" => cmd_extended(rest).await,
        "probe" => cmd_probe(rest).await,
        "load" => cmd_load(rest).await,
        "status" => cmd_status(rest).await,
        "clear" => cmd_clear(rest).await,
        "info" => cmd_info(rest).await,
        "version" | "--version" | "-V" => {
            println!("fundingsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("fundingsync {}", env!("CARGO_PKG_VERSION"));
    println!("Incremental funding-payment history with a monthly cache\n");
    println!("USAGE:");
    println!("    fundingsync <COMMAND> [FLAGS]\n");
    println!("COMMANDS:");
    println!("    fetch      Fetch the last N days (paginated, stops at the cutoff)");
    println!("    extended   Fetch a 90/180/365-day window month by month");
    println!("    probe      Scan the trailing twelve months for any history");
    println!("    load       Run the full loading sequence and print phase changes");
    println!("    status     Show cached coverage for a wallet");
    println!("    clear      Remove cached data (one wallet, or everything)");
    println!("    info       Show configuration and cache usage");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("FLAGS:");
    println!("    --wallet <ADDR>    Wallet address  [required for fetch/extended/probe/load/status]");
    println!("    --days <N>         Days for fetch  [default: 30]");
    println!("    --window <D>       90 | 180 | 365  [required for extended]");
    println!("    --db <PATH>        SQLite cache file  [env: FUNDINGSYNC_DB]");
    println!("    --url <URL>        API base URL  [env: FUNDINGSYNC_API_URL]");
    println!("    --config <PATH>    JSON config file");
    println!("    --json-logs        Emit logs as JSON on stderr");
}

// ─── Setup ────────────────────────────────────────────────────────────────────

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

fn require_wallet(args: &[String]) -> anyhow::Result<String> {
    parse_flag(args, "--wallet").ok_or_else(|| anyhow!("--wallet is required"))
}

/// Read the config file and overrides, then start logging.
fn setup(args: &[String]) -> anyhow::Result<CliConfig> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => CliConfig::load(Path::new(&path))?,
        None => CliConfig::default(),
    };
    config.apply_overrides(
        |key| env::var(key).ok(),
        parse_flag(args, "--db"),
        parse_flag(args, "--url"),
        has_flag(args, "--json-logs"),
    );
    init_tracing(&config.log);
    debug!(db = config.db_path(), url = %config.http.base_url, "configuration loaded");
    Ok(config)
}

async fn open_kv(config: &CliConfig) -> anyhow::Result<Arc<SqliteKvStore>> {
    let kv = SqliteKvStore::open(config.db_path())
        .await
        .with_context(|| format!("opening cache {}", config.db_path()))?;
    let kv = match config.db_capacity_bytes {
        Some(capacity) => kv.with_capacity_bytes(capacity),
        None => kv,
    };
    Ok(Arc::new(kv))
}

async fn open_store(config: &CliConfig) -> anyhow::Result<Arc<RecordStore>> {
    Ok(Arc::new(RecordStore::new(open_kv(config).await?, &config.sync)))
}

async fn build_fetcher(config: &CliConfig) -> anyhow::Result<Arc<FundingFetcher>> {
    let store = open_store(config).await?;
    let source = HttpFundingSource::new(config.http.clone())?;
    Ok(Arc::new(FundingFetcher::new(
        Arc::new(source),
        store,
        Arc::new(SystemClock),
        config.sync.clone(),
    )))
}

// ─── Output ───────────────────────────────────────────────────────────────────

/// Prints fetch events as they arrive. Failures are left to the caller.
struct Printer<'a> {
    loader: Option<&'a FundingLoader>,
    last_phase: Phase,
}

impl<'a> Printer<'a> {
    fn new() -> Self {
        Self {
            loader: None,
            last_phase: Phase::Idle,
        }
    }

    fn following(loader: &'a FundingLoader) -> Self {
        Self {
            loader: Some(loader),
            last_phase: Phase::Idle,
        }
    }
}

impl FetchObserver for Printer<'_> {
    fn on_event(&mut self, event: FetchEvent) {
        match &event {
            FetchEvent::CacheHit => println!("  cache hit"),
            FetchEvent::Milestone(m) => println!("  {m} loaded"),
            FetchEvent::Records { records, days_loaded } => {
                println!("  +{} records ({days_loaded} days)", records.len())
            }
            FetchEvent::Progress(p) => {
                let label = match p.phase {
                    ProgressPhase::CheckingCache => "checking cache",
                    ProgressPhase::Fetching => "fetching",
                    ProgressPhase::Complete => "done",
                };
                println!("  months {}/{} {label}", p.months_satisfied, p.months_total);
            }
            FetchEvent::Complete { .. } | FetchEvent::Failed(_) => {}
        }

        if let Some(loader) = self.loader {
            let phase = loader.current_phase();
            if phase != self.last_phase {
                println!("phase: {} → {phase}", self.last_phase);
                self.last_phase = phase;
            }
        }
    }
}

/// End-user text first, the technical cause in parentheses.
fn user_error(e: FundingError) -> anyhow::Error {
    anyhow!("{} ({e})", e.user_message())
}

fn print_summary(records: &[FundingRecord]) {
    let total: f64 = records.iter().map(|r| r.funding_payment).sum();
    println!("Records: {}", records.len());
    if let (Some(newest), Some(oldest)) = (records.first(), records.last()) {
        println!("  Newest: {}", newest.ts);
        println!("  Oldest: {}", oldest.ts);
    }
    println!("  Net funding: {total:.6}");
}

// ─── Commands ─────────────────────────────────────────────────────────────────

async fn cmd_fetch(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let wallet = require_wallet(args)?;
    let days: u32 = match parse_flag(args, "--days") {
        Some(d) => d.parse().with_context(|| format!("invalid --days {d}"))?,
        None => 30,
    };
    if days == 0 {
        bail!("--days must be at least 1");
    }

    let fetcher = build_fetcher(&config).await?;
    println!("Fetching {days} days for {wallet}...");
    let records = fetcher
        .fetch_incremental(&wallet, days, &mut Printer::new())
        .await
        .map_err(user_error)?;
    print_summary(&records);
    Ok(())
}

async fn cmd_extended(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let wallet = require_wallet(args)?;
    let raw = parse_flag(args, "--window").ok_or_else(|| anyhow!("--window is required"))?;
    let window = raw
        .trim_end_matches('d')
        .parse()
        .ok()
        .and_then(Window::from_days)
        .filter(Window::is_extended)
        .ok_or_else(|| anyhow!("--window must be 90, 180 or 365 (got {raw})"))?;

    let fetcher = build_fetcher(&config).await?;
    println!("Fetching {window} for {wallet}...");
    let records = fetcher
        .fetch_extended(&wallet, window, &mut Printer::new())
        .await
        .map_err(user_error)?;
    print_summary(&records);
    Ok(())
}

async fn cmd_probe(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let wallet = require_wallet(args)?;

    let fetcher = build_fetcher(&config).await?;
    println!("Probing trailing {} months for {wallet}...", config.sync.probe_months);
    let records = fetcher
        .probe_twelve_months(&wallet, &mut Printer::new())
        .await
        .map_err(user_error)?;
    print_summary(&records);
    Ok(())
}

async fn cmd_load(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let wallet = require_wallet(args)?;

    let loader = FundingLoader::new(build_fetcher(&config).await?);
    println!("Loading {wallet}...");
    let report = loader
        .load(&wallet, &mut Printer::following(&loader))
        .await
        .map_err(user_error)?;

    match report {
        LoadReport::Completed { phase, records } => {
            println!("Finished in phase {phase}");
            print_summary(&records);
        }
        LoadReport::AlreadyInFlight => println!("A load for {wallet} is already running"),
        LoadReport::Superseded => println!("Load superseded"),
    }
    Ok(())
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let wallet = require_wallet(args)?;
    let store = open_store(&config).await?;

    println!("Wallet: {wallet}");
    match store.read_index(&wallet).await {
        Some(index) => {
            println!("  Covered:    {} .. {} ({} days)", index.oldest, index.newest, index.covered_days());
            println!("  Updated at: {}", index.updated_at);
            println!("  Exhausted:  {}", index.exhausted);
        }
        None => println!("  No day index"),
    }

    let months = store.cached_months(&wallet).await;
    println!("  Cached months: {}", months.len());
    for month in months {
        if let Some(bucket) = store.read_month(&wallet, month).await {
            println!(
                "    {month}  records={:<5} complete={:<5} closed={}",
                bucket.records.len(),
                bucket.complete,
                bucket.closed
            );
        }
    }
    Ok(())
}

async fn cmd_clear(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;
    let store = open_store(&config).await?;

    let removed = match parse_flag(args, "--wallet") {
        Some(wallet) => store.clear_wallet(&wallet).await,
        None => store.clear_all().await,
    };
    println!("Removed {removed} cache entries");
    Ok(())
}

async fn cmd_info(args: &[String]) -> anyhow::Result<()> {
    let config = setup(args)?;

    println!("fundingsync v{}", env!("CARGO_PKG_VERSION"));
    println!("  API base URL:        {}", config.http.base_url);
    println!("  Request timeout:     {}ms", config.http.request_timeout_ms);
    println!("  Month batch size:    {}", config.sync.month_batch_size);
    println!("  Probe months:        {}", config.sync.probe_months);
    println!("  Open month TTL:      {}s", config.sync.policy.open_month_ttl_secs);
    println!("  Day index TTL:       {}s", config.sync.policy.index_ttl_secs);
    let windows: Vec<String> = config.sync.extended_windows.iter().map(Window::to_string).collect();
    println!("  Extended windows:    {}", windows.join(", "));
    println!("  Cache file:          {}", config.db_path());

    let usage = open_kv(&config).await?.usage().await?;
    println!("  Cache entries:       {}", usage.entries);
    println!("  Cache bytes:         {}", usage.bytes);
    Ok(())
}
