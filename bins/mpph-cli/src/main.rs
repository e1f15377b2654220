mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args as ClapArgs, Parser, Subcommand};
use mpph_core::{IngestionClient, MigrationSpec, Message, Sink, Source, Transform};
use mpph_io::pacing::Pacer;
use mpph_io::sink_posthog::{PostHogClient, PostHogSink};
use mpph_io::sink_stdout::StdoutClient;
use mpph_io::source_csv::UsersCsvSource;
use mpph_io::source_export::{ExportFileSource, MixpanelExportSource};
use mpph_tx::{EventTransform, EventTransformer, UserReconcile};
use tokio::{signal, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type DynClient = Box<dyn IngestionClient + Sync>;

#[derive(Parser, Debug)]
#[command(name = "mpph", version, about = "Migrate Mixpanel events and users into PostHog")]
struct Args {
    /// Migration YAML (env vars override it)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    /// Bounded channel capacity between operators
    #[arg(long, default_value_t = 1, global = true)]
    channel_capacity: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export raw events from Mixpanel and capture them in PostHog
    Events(EventsArgs),
    /// Reconcile a Mixpanel people CSV and identify the users in PostHog
    Users(UsersArgs),
}

#[derive(ClapArgs, Debug)]
struct EventsArgs {
    /// First day of the export (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date, required_unless_present = "export_file")]
    from_date: Option<NaiveDate>,
    /// Last day of the export, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = parse_date, required_unless_present = "export_file")]
    to_date: Option<NaiveDate>,
    /// Read a downloaded export (path or glob) instead of calling the export API
    #[arg(long, conflicts_with_all = ["from_date", "to_date"])]
    export_file: Option<String>,
    /// Print capture messages instead of sending them
    #[arg(long)]
    dry_run: bool,
}

#[derive(ClapArgs, Debug)]
struct UsersArgs {
    /// Mixpanel people CSV export
    #[arg(long)]
    csv_file: String,
    /// Print identify messages instead of sending them
    #[arg(long)]
    dry_run: bool,
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| format!("{s}: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let spec = MigrationSpec::load(args.config.as_deref()).context("loading configuration")?;
    spec.log_config();

    let capacity = args.channel_capacity.max(1);

    // Ctrl-C handling
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping pipeline");
            interrupt.cancel();
        }
    });

    match args.command {
        Command::Events(events) => run_events(&spec, events, capacity, cancel).await,
        Command::Users(users) => run_users(&spec, users, capacity, cancel).await,
    }
}

async fn run_events(
    spec: &MigrationSpec,
    args: EventsArgs,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let source: Box<dyn Source> = match (args.export_file, args.from_date, args.to_date) {
        (Some(path), _, _) => Box::new(ExportFileSource::new("mixpanel-export-file".into(), path)),
        (None, Some(from), Some(to)) => {
            spec.validate_export()?;
            Box::new(MixpanelExportSource::try_new(
                "mixpanel-export".into(),
                spec.mixpanel.clone(),
                from,
                to,
            )?)
        }
        _ => anyhow::bail!("either --export-file or both --from-date and --to-date are required"),
    };

    let transform = EventTransform::new(
        "events".into(),
        EventTransformer::new(env!("CARGO_PKG_VERSION")),
    );
    let spacing = spec.pacing.event_spacing();
    info!(spacing = ?spacing, "Importing events into PostHog");

    let client = ingestion_client(spec, args.dry_run)?;
    run_pipeline(source, Box::new(transform), client, spacing, capacity, cancel).await
}

async fn run_users(
    spec: &MigrationSpec,
    args: UsersArgs,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let source = UsersCsvSource::new("users-csv".into(), args.csv_file);
    let spacing = spec.pacing.user_spacing();
    let rows = source.count_rows()?;
    info!(
        users = rows,
        estimate = ?Pacer::new(spacing).estimate(rows),
        "Importing users into PostHog"
    );

    let client = ingestion_client(spec, args.dry_run)?;
    run_pipeline(
        Box::new(source),
        Box::new(UserReconcile::new("reconcile".into())),
        client,
        spacing,
        capacity,
        cancel,
    )
    .await
}

fn ingestion_client(spec: &MigrationSpec, dry_run: bool) -> Result<DynClient> {
    if dry_run {
        info!("Dry run: messages are printed, nothing is sent");
        return Ok(Box::new(StdoutClient::new()));
    }
    spec.validate_ingest()?;
    Ok(Box::new(PostHogClient::new(&spec.posthog)?))
}

/// Source → transform → PostHog sink, one task each.
///
/// A cancelled run is an error: whatever was delivered stays delivered, but
/// the migration is incomplete.
async fn run_pipeline(
    mut source: Box<dyn Source>,
    mut transform: Box<dyn Transform>,
    client: DynClient,
    spacing: Duration,
    capacity: usize,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx1, rx1) = mpsc::channel::<Message>(capacity);
    let (tx2, rx2) = mpsc::channel::<Message>(capacity);
    let mut sink = PostHogSink::new("posthog".into(), client, spacing);

    // Spawn tasks
    let c1 = cancel.child_token();
    let src_handle = tokio::spawn(async move { source.run(tx1, c1).await });
    let c2 = cancel.child_token();
    let tf_handle = tokio::spawn(async move { transform.run(rx1, tx2, c2).await });
    let c3 = cancel.child_token();
    let sink_handle = tokio::spawn(async move {
        let result = sink.run(rx2, c3).await;
        (result, sink.delivered())
    });

    // Join
    let source_result = src_handle.await?;
    let transform_result = tf_handle.await?;
    let (sink_result, delivered) = sink_handle.await?;

    sink_result.context("importing into PostHog")?;
    source_result.context("reading from Mixpanel")?;
    transform_result?;

    if cancel.is_cancelled() {
        anyhow::bail!("migration interrupted after {delivered} records");
    }
    info!(delivered, "Migration finished");
    Ok(())
}
