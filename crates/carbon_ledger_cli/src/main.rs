//! carbon-ledger CLI: accounts, claims, sensor pings, dashboard and marketplace.

use carbon_ledger::ledger::fingerprint;
use carbon_ledger::{
    ClaimKind, Ledger, LedgerConfig, Marketplace, NewAccount, NewListing, Outcome, SensorMonitor,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::info;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::load_from_path(path),
        None => LedgerConfig::load(),
    };
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    let ledger = Ledger::open(config)?;
    match cli.command {
        Command::Register(args) => run_register(&ledger, args),
        Command::Verify(args) => run_claim(&ledger, args, ClaimKind::Plantation),
        Command::Tokenise(args) => run_claim(&ledger, args, ClaimKind::Certificate),
        Command::Ingest(args) => run_ingest(&ledger, args),
        Command::Summary(args) => run_summary(&ledger, args),
        Command::Telemetry(args) => print_json(&ledger.telemetry(args.user, OffsetDateTime::now_utc())?),
        Command::History(args) => print_json(&ledger.history(args.user)?),
        Command::Watch(args) => run_watch(&ledger, args),
        Command::List(args) => run_list(&ledger, args),
        Command::Listings(args) => run_listings(&ledger, args),
        Command::Buy(args) => run_buy(&ledger, args),
    }
}

#[derive(Parser)]
#[command(name = "carbon-ledger")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Carbon-credit ledger: plantation verification, certificate tokenisation, consumption and marketplace")]
struct Cli {
    /// Config file; defaults to the env var / ./config lookup.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the SQLite database path.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account.
    Register(RegisterArgs),
    /// Verify a plantation claim from OCR text and credit the award.
    Verify(ClaimArgs),
    /// Tokenise a carbon certificate from OCR text.
    Tokenise(ClaimArgs),
    /// Apply a consumption sensor reading.
    Ingest(IngestArgs),
    /// Dashboard summary with its fingerprint.
    Summary(UserArgs),
    /// Consumption telemetry view.
    Telemetry(UserArgs),
    /// Full event history.
    History(UserArgs),
    /// Poll sensor liveness.
    Watch(WatchArgs),
    /// Create a marketplace listing.
    List(ListArgs),
    /// Show unsold listings, or one owner's listings.
    Listings(ListingsArgs),
    /// Buy a listing.
    Buy(BuyArgs),
}

#[derive(Parser)]
struct RegisterArgs {
    #[arg(long)]
    email: String,
    #[arg(long)]
    handle: String,
    #[arg(long)]
    credential_hash: String,
    #[arg(long)]
    wallet: Option<String>,
}

#[derive(Parser)]
struct ClaimArgs {
    #[arg(long)]
    user: i64,
    /// File holding the OCR text; `-` reads stdin.
    #[arg(long)]
    text: PathBuf,
    /// Certificate registry or issuer (tokenise only).
    #[arg(long)]
    source: Option<String>,
}

#[derive(Parser)]
struct IngestArgs {
    #[arg(long)]
    user: i64,
    /// Credits used, as a decimal.
    #[arg(long)]
    credits: String,
}

#[derive(Parser)]
struct UserArgs {
    #[arg(long)]
    user: i64,
}

#[derive(Parser)]
struct WatchArgs {
    #[arg(long)]
    user: i64,
    #[arg(long, default_value_t = 90)]
    interval_secs: u64,
    /// Stop after this many checks.
    #[arg(long, default_value_t = 3)]
    rounds: u32,
}

#[derive(Parser)]
struct ListArgs {
    #[arg(long)]
    owner: i64,
    #[arg(long)]
    title: String,
    #[arg(long)]
    quantity: String,
    #[arg(long)]
    price: String,
    #[arg(long)]
    description: Option<String>,
}

#[derive(Parser)]
struct ListingsArgs {
    #[arg(long)]
    owner: Option<i64>,
}

#[derive(Parser)]
struct BuyArgs {
    #[arg(long)]
    listing: i64,
    #[arg(long)]
    buyer: i64,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_text(path: &std::path::Path) -> Result<String, Box<dyn std::error::Error>> {
    if path.as_os_str() == "-" {
        return Ok(std::io::read_to_string(std::io::stdin())?);
    }
    Ok(std::fs::read_to_string(path)?)
}

fn run_register(ledger: &Ledger, args: RegisterArgs) -> Result<(), Box<dyn std::error::Error>> {
    let account = ledger.create_account(&NewAccount {
        email: args.email,
        handle: args.handle,
        credential_hash: args.credential_hash,
        wallet: args.wallet,
    })?;
    info!(user_id = account.id, "account registered");
    print_json(&account)
}

fn run_claim(
    ledger: &Ledger,
    args: ClaimArgs,
    kind: ClaimKind,
) -> Result<(), Box<dyn std::error::Error>> {
    let text = read_text(&args.text)?;
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        match kind {
            ClaimKind::Plantation => ledger.verify_plantation(args.user, &text).await,
            ClaimKind::Certificate => {
                ledger
                    .tokenise_certificate(args.user, &text, args.source.as_deref())
                    .await
            }
        }
    })?;
    print_json(&outcome)?;
    if let Outcome::Rejected(rejection) = outcome {
        eprintln!("REJECTED\t{}", rejection);
        std::process::exit(2);
    }
    Ok(())
}

fn run_ingest(ledger: &Ledger, args: IngestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let applied = ledger.ingest(args.user, &serde_json::Value::String(args.credits))?;
    print_json(&applied)
}

fn run_summary(ledger: &Ledger, args: UserArgs) -> Result<(), Box<dyn std::error::Error>> {
    let summary = ledger.get_summary(args.user, OffsetDateTime::now_utc())?;
    print_json(&serde_json::json!({
        "summary": summary,
        "fingerprint_sha256": fingerprint(&summary)?,
    }))
}

fn run_watch(ledger: &Ledger, args: WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rt = tokio::runtime::Runtime::new()?;
    let mut monitor = SensorMonitor::new();
    for round in 0..args.rounds {
        if round > 0 {
            rt.block_on(tokio::time::sleep(Duration::from_secs(args.interval_secs)));
        }
        let account = ledger.account(args.user)?;
        let status = monitor.observe(args.user, account.last_ping, OffsetDateTime::now_utc());
        println!("{}", serde_json::to_string(&status)?);
    }
    Ok(())
}

fn run_list(ledger: &Ledger, args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let market = Marketplace::new(ledger.store());
    let listing = market.create_listing(
        args.owner,
        &NewListing {
            title: args.title,
            description: args.description,
            quantity: args.quantity.parse()?,
            unit_price: args.price.parse()?,
        },
    )?;
    print_json(&listing)
}

fn run_listings(ledger: &Ledger, args: ListingsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let market = Marketplace::new(ledger.store());
    match args.owner {
        Some(owner) => print_json(&market.listings_of(owner)?),
        None => print_json(&market.list_active()?),
    }
}

fn run_buy(ledger: &Ledger, args: BuyArgs) -> Result<(), Box<dyn std::error::Error>> {
    let market = Marketplace::new(ledger.store());
    let listing = market.buy(args.listing, args.buyer)?;
    print_json(&listing)
}
