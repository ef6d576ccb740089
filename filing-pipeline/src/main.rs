use anyhow::Context;
use chrono::{Duration as ChronoDuration, Local};
use clap::Parser;
use filing_pipeline::{
    Cli, Command, EdgarFeedSource, ExtractorRegistryBuilder, FeedPoller, FilingFeed, FilingStore,
    ProcessingCoordinator, QueueItem,
};
use interfaces::EmptySignalGenerator;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.validate()?;

    tracing_subscriber::fmt().with_max_level(cli.log_level()?).init();

    let store = Arc::new(
        FilingStore::open(&cli.database)
            .await
            .with_context(|| format!("opening {}", cli.database.display()))?,
    );

    let result = dispatch(&cli, store.clone()).await;
    store.close().await;
    result
}

fn build_poller(cli: &Cli, store: Arc<FilingStore>) -> anyhow::Result<FeedPoller> {
    let feed: Arc<dyn FilingFeed> = Arc::new(EdgarFeedSource::new(cli.fetch_config())?);
    Ok(FeedPoller::new(feed, store, cli.poller_config()))
}

fn build_coordinator(cli: &Cli, store: Arc<FilingStore>) -> ProcessingCoordinator {
    let registry = ExtractorRegistryBuilder::new()
        .add_baseline(&cli.supported_forms())
        .build();
    info!("Extractors registered for: {}", registry.list().join(", "));

    ProcessingCoordinator::new(
        store,
        Arc::new(registry),
        Arc::new(EmptySignalGenerator),
        cli.coordinator_config(),
    )
}

async fn dispatch(cli: &Cli, store: Arc<FilingStore>) -> anyhow::Result<()> {
    match &cli.command {
        Command::Run => run(cli, store).await,
        Command::Poll => {
            let poller = build_poller(cli, store)?;
            let report = poller.poll_once().await?;
            if report.fetch_failed {
                warn!("Feed unavailable, nothing collected this cycle");
            }
            println!(
                "fetched {}  new {}  already seen {}  repeated in snapshot {}",
                report.fetched, report.enqueued, report.already_seen, report.duplicates_in_cycle
            );
            Ok(())
        }
        Command::Process => {
            let coordinator = build_coordinator(cli, store);
            coordinator.recover().await?;
            let report = coordinator.process_until_idle().await?;
            for signal in coordinator.history().snapshot().await {
                println!(
                    "{}  {:<10} {:<24} {:>5.2}  {}",
                    signal.accession, signal.company_id, signal.signal_type, signal.strength, signal.reasoning
                );
            }
            println!(
                "claimed {}  done {}  retried {}  failed {}  signals {}",
                report.claimed, report.done, report.retried, report.failed, report.signals
            );
            Ok(())
        }
        Command::Backfill { days } => {
            let poller = build_poller(cli, store)?;
            let report = poller.backfill(Local::now().date_naive(), *days).await?;
            for (date, day) in &report.days {
                if day.fetch_failed {
                    println!("{}  fetch failed", date);
                } else {
                    println!("{}  new {:>5}  seen {:>5}", date, day.enqueued, day.already_seen);
                }
            }
            println!(
                "{} days, {} new filings, {} days failed",
                report.days.len(),
                report.total_enqueued(),
                report.failed_days()
            );
            Ok(())
        }
        Command::Summary { days } => {
            let since = Local::now().date_naive() - ChronoDuration::days(i64::from(*days));
            let rows = store.filing_summary(since).await?;
            println!("{:<12} {:<10} {:>6}  {}", "CIK", "FORM", "COUNT", "LATEST");
            for row in rows {
                let latest = row.latest_filing.map(|d| d.to_string()).unwrap_or_default();
                println!("{:<12} {:<10} {:>6}  {}", row.company_id, row.form_type, row.filing_count, latest);
            }
            Ok(())
        }
        Command::Search { .. } => {
            let query = cli.command.filing_query().unwrap_or_default();
            let items = store.search_filings(&query).await?;
            for item in &items {
                print_item(item);
            }
            println!("{} filings", items.len());
            Ok(())
        }
        Command::Stats => {
            let stats = store.queue_stats().await?;
            println!("queued       {}", stats.queued());
            println!("  pending    {}", stats.pending);
            println!("  in progress {}", stats.in_progress);
            println!("  done       {}", stats.done);
            println!("  failed     {}", stats.failed);
            println!("seen         {}", stats.seen);
            println!("signals      {}", stats.signals);
            for (form, count) in &stats.top_forms {
                println!("  {:<10} {}", form, count);
            }
            Ok(())
        }
        Command::Signals { limit } => {
            for signal in store.recent_signals(*limit).await? {
                println!(
                    "{}  {}  {:<10} {:<24} {:>5.2}  {}",
                    signal.generated_at.format("%Y-%m-%d %H:%M:%S"),
                    signal.accession,
                    signal.company_id,
                    signal.signal_type,
                    signal.strength,
                    signal.reasoning
                );
            }
            Ok(())
        }
    }
}

fn print_item(item: &QueueItem) {
    let date = item.filing.filing_date.map(|d| d.to_string()).unwrap_or_default();
    println!(
        "{:<10} {:<22} {:<8} {:<12} {:<30} {}",
        date,
        item.filing.accession,
        item.filing.form_type,
        item.filing.company_id,
        item.filing.company_name.as_deref().unwrap_or(""),
        item.status
    );
}

fn note_outcome(
    joined: std::result::Result<filing_pipeline::Result<()>, JoinError>,
    failure: &mut Option<anyhow::Error>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Task ended with error: {}", e);
            failure.get_or_insert(anyhow::Error::from(e));
        }
        Err(e) => {
            error!("Task panicked: {}", e);
            failure.get_or_insert(anyhow::Error::from(e));
        }
    }
}

async fn run(cli: &Cli, store: Arc<FilingStore>) -> anyhow::Result<()> {
    let poller = Arc::new(build_poller(cli, store.clone())?);
    let coordinator = Arc::new(build_coordinator(cli, store));
    coordinator.recover().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { poller.run(shutdown).await });
    }
    for worker in 0..cli.workers {
        let coordinator = coordinator.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { coordinator.run(worker, shutdown).await });
    }

    let mut failure = None;
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Shutdown requested");
        }
        Some(joined) = tasks.join_next() => {
            note_outcome(joined, &mut failure);
            warn!("A pipeline task stopped early, shutting down the rest");
        }
    }

    // receivers may already be gone if every task halted
    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.join_next().await {
        note_outcome(joined, &mut failure);
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
