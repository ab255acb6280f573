use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use sellkit_api::{BackendConfig, HttpBackend, StaticBackend};
use sellkit_core::{
    ledger, Backend, EmbedOptions, IdentityManager, ManualClock, OfferId, OfferWidget, PageHost,
    PageSignal, ScrollMetrics, SimulatedPage,
};
use sellkit_store_sqlite::SqliteStore;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use url::Url;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "warn";
const DEFAULT_CHECKOUT_URL: &str = "https://mysellkit.com/version-test";

#[derive(Debug, Parser)]
#[command(name = "sk")]
#[command(about = "SellKit offer surface CLI")]
struct Cli {
    #[arg(long, default_value = "./sellkit.sqlite3")]
    db: PathBuf,

    /// Tracing filter for stderr output; falls back to `RUST_LOG`, then `warn`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Store {
        #[command(subcommand)]
        command: Box<StoreCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
    Identity {
        #[command(subcommand)]
        command: Box<IdentityCommand>,
    },
    /// Simulate one page load of an offer and replay visitor steps against it.
    Visit(Box<VisitArgs>),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    Dump,
    /// Clear the ephemeral scope, as closing the browser tab would.
    EndSession,
}

#[derive(Debug, Subcommand)]
enum LedgerCommand {
    Status(OfferArgs),
    Mark(OfferArgs),
}

#[derive(Debug, Args)]
struct OfferArgs {
    #[arg(long)]
    offer: String,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Show(IdentityShowArgs),
}

#[derive(Debug, Args)]
struct IdentityShowArgs {
    #[arg(long, default_value_t = false)]
    diagnostic: bool,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
struct VisitArgs {
    #[arg(long)]
    offer: Option<String>,
    #[arg(long)]
    url: String,
    #[arg(long, conflicts_with = "api_base", required_unless_present = "api_base")]
    config_file: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long, default_value = DEFAULT_CHECKOUT_URL)]
    checkout_url: String,
    #[arg(long)]
    timeout_ms: Option<u64>,
    #[arg(long)]
    now: Option<String>,
    #[arg(long, default_value_t = SimulatedPage::DEFAULT_VIEWPORT_WIDTH)]
    viewport_width: u32,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long, default_value_t = false)]
    diagnostic: bool,
    /// `scroll:<y>:<doc>:<viewport>`, `wait:<seconds>`, `leave:<y>`, `close`, `open`,
    /// `reminder-click`, `reminder-dismiss` or `checkout`.
    #[arg(long = "step")]
    steps: Vec<VisitStep>,
}

#[derive(Debug, Clone, PartialEq)]
enum VisitStep {
    Scroll(ScrollMetrics),
    Wait(time::Duration),
    Leave(f64),
    Close,
    Open,
    ReminderClick,
    ReminderDismiss,
    Checkout,
}

impl VisitStep {
    fn label(&self) -> String {
        match self {
            Self::Scroll(metrics) => format!(
                "scroll:{}:{}:{}",
                metrics.scroll_y, metrics.document_height, metrics.viewport_height
            ),
            Self::Wait(duration) => format!("wait:{}", duration.as_seconds_f64()),
            Self::Leave(client_y) => format!("leave:{client_y}"),
            Self::Close => "close".to_string(),
            Self::Open => "open".to_string(),
            Self::ReminderClick => "reminder-click".to_string(),
            Self::ReminderDismiss => "reminder-dismiss".to_string(),
            Self::Checkout => "checkout".to_string(),
        }
    }
}

impl FromStr for VisitStep {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split(':').collect();
        match parts.as_slice() {
            ["scroll", scroll_y, document_height, viewport_height] => {
                Ok(Self::Scroll(ScrollMetrics {
                    scroll_y: parse_number(scroll_y)?,
                    document_height: parse_number(document_height)?,
                    viewport_height: parse_number(viewport_height)?,
                }))
            }
            ["wait", seconds] => {
                let seconds = parse_number(seconds)?;
                if !(0.0..=MAX_WAIT_SECONDS).contains(&seconds) {
                    return Err(anyhow!(
                        "wait seconds MUST be between 0 and {MAX_WAIT_SECONDS}: {seconds}"
                    ));
                }
                let duration = time::Duration::checked_seconds_f64(seconds)
                    .ok_or_else(|| anyhow!("wait seconds out of range: {seconds}"))?;
                Ok(Self::Wait(duration))
            }
            ["leave", client_y] => Ok(Self::Leave(parse_number(client_y)?)),
            ["close"] => Ok(Self::Close),
            ["open"] => Ok(Self::Open),
            ["reminder-click"] => Ok(Self::ReminderClick),
            ["reminder-dismiss"] => Ok(Self::ReminderDismiss),
            ["checkout"] => Ok(Self::Checkout),
            _ => Err(anyhow!("unrecognised visit step: {raw}")),
        }
    }
}

/// One year; keeps the simulated clock inside the representable date range.
const MAX_WAIT_SECONDS: f64 = 366.0 * 86_400.0;

fn parse_number(raw: &str) -> Result<f64> {
    let value = raw.trim().parse::<f64>().with_context(|| format!("invalid number: {raw}"))?;
    if !value.is_finite() {
        return Err(anyhow!("number MUST be finite: {raw}"));
    }
    Ok(value)
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Store { command } => run_store(*command, &mut store),
        Command::Ledger { command } => run_ledger(*command, &mut store),
        Command::Identity { command } => run_identity(*command, &mut store),
        Command::Visit(args) => run_visit(&args, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_store(command: StoreCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        StoreCommand::Dump => {
            let entries = store.entries()?;
            emit_json(json!({
                "count": entries.len(),
                "entries": entries
            }))
        }
        StoreCommand::EndSession => {
            let removed = store.end_browsing_session()?;
            emit_json(json!({ "removed": removed }))
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        LedgerCommand::Status(args) => {
            let offer = parse_offer(&args.offer)?;
            let purchased = ledger::has_purchased(&*store, &offer)?;
            emit_json(json!({ "offer_id": offer, "purchased": purchased }))
        }
        LedgerCommand::Mark(args) => {
            let offer = parse_offer(&args.offer)?;
            let newly_marked = ledger::mark_purchased(store, &offer)?;
            emit_json(json!({ "offer_id": offer, "purchased": true, "newly_marked": newly_marked }))
        }
    }
}

fn run_identity(command: IdentityCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        IdentityCommand::Show(args) => {
            let now = parse_optional_rfc3339(args.now.as_deref())?;
            store.set_clock(ManualClock::new(now));
            store.migrate()?;
            let before = IdentityManager::stored(&*store)?;
            let session_id = IdentityManager::new(args.diagnostic).session_id(store, now)?;
            let reused = before.as_ref().is_some_and(|stored| stored.id == session_id);
            let stored = IdentityManager::stored(&*store)?;
            emit_json(json!({
                "session_id": session_id,
                "diagnostic": args.diagnostic,
                "reused": reused,
                "stored": stored
            }))
        }
    }
}

fn run_visit(args: &VisitArgs, store: &mut SqliteStore) -> Result<()> {
    let now = parse_optional_rfc3339(args.now.as_deref())?;
    let clock = ManualClock::new(now);
    store.set_clock(clock.clone());
    store.migrate()?;
    let page_url = Url::parse(&args.url).with_context(|| format!("invalid page url {}", args.url))?;

    let fixture = args.config_file.as_deref().map(StaticBackend::from_yaml_file).transpose()?;
    let http = match (&fixture, args.api_base.as_deref()) {
        (None, Some(api_base)) => {
            let mut config = BackendConfig::new(api_base, &args.checkout_url)?;
            if let Some(timeout_ms) = args.timeout_ms {
                config = config.with_timeout(std::time::Duration::from_millis(timeout_ms));
            }
            Some(HttpBackend::new(config))
        }
        _ => None,
    };
    let backend: &dyn Backend = match (&fixture, &http) {
        (Some(fixture), _) => fixture,
        (None, Some(http)) => http,
        (None, None) => return Err(anyhow!("visit needs --config-file or --api-base")),
    };

    let checkout_base = Url::parse(&args.checkout_url)
        .with_context(|| format!("invalid checkout url {}", args.checkout_url))?;
    let mut options = EmbedOptions::new(String::new(), checkout_base);
    options.offer_id.clone_from(&args.offer);
    options.diagnostic_attribute = args.diagnostic;

    let mut page = SimulatedPage::new(page_url, clock.clone()).with_viewport_width(args.viewport_width);
    if let Some(user_agent) = args.user_agent.as_deref() {
        page = page.with_user_agent(user_agent);
    }

    let mut widget = OfferWidget::new(options, &mut *store, backend, page, clock);
    let init = widget.init()?;
    tracing::info!(init = ?init, "visit initialised");

    let mut steps = Vec::with_capacity(args.steps.len());
    for step in &args.steps {
        let outcome = run_step(&mut widget, step)?;
        steps.push(json!({
            "step": step.label(),
            "outcome": outcome,
            "surface": widget.surface()
        }));
    }

    let host = widget.host();
    let output = json!({
        "offer_id": args.offer,
        "diagnostic": widget.diagnostic(),
        "init": init,
        "steps": steps,
        "final_surface": widget.surface(),
        "cta_state": widget.cta_state(),
        "progress": widget.progress(),
        "notices": host.notices(),
        "redirects": host.redirects(),
        "final_url": host.current_url(),
        "events": fixture.as_ref().map(StaticBackend::events),
        "checkout_requests": fixture.as_ref().map(StaticBackend::checkout_requests)
    });
    emit_json(output)
}

fn run_step<S, B>(
    widget: &mut OfferWidget<S, B, SimulatedPage, ManualClock>,
    step: &VisitStep,
) -> Result<Value>
where
    S: sellkit_core::PersistencePort,
    B: Backend,
{
    let value = match step {
        VisitStep::Scroll(metrics) => match widget.host().scroll(*metrics) {
            Some(signal) => serde_json::to_value(widget.handle_signal(&signal)?)?,
            None => json!({ "outcome": "no_listener" }),
        },
        VisitStep::Leave(client_y) => match widget.host().pointer_leave(*client_y) {
            Some(signal) => serde_json::to_value(widget.handle_signal(&signal)?)?,
            None => json!({ "outcome": "no_listener" }),
        },
        VisitStep::Wait(duration) => {
            let due: Vec<PageSignal> = widget.host_mut().advance(*duration);
            let mut fired = Vec::with_capacity(due.len());
            for signal in &due {
                fired.push(widget.handle_signal(signal)?);
            }
            json!({ "timers": fired })
        }
        VisitStep::Close => serde_json::to_value(widget.close()?)?,
        VisitStep::Open => serde_json::to_value(widget.open()?)?,
        VisitStep::ReminderClick => serde_json::to_value(widget.click_reminder()?)?,
        VisitStep::ReminderDismiss => json!({ "dismissed": widget.dismiss_reminder() }),
        VisitStep::Checkout => serde_json::to_value(widget.attempt_checkout()?)?,
    };
    Ok(value)
}

fn parse_offer(raw: &str) -> Result<OfferId> {
    OfferId::parse(raw).with_context(|| format!("invalid offer id {raw:?}"))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<OffsetDateTime> {
    value.map_or_else(|| Ok(OffsetDateTime::now_utc()), parse_rfc3339)
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}
