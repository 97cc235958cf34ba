mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{create_progress_bar, Cli, OfflineSource};
use era5_precip::{
    get_default_data_dir, load_locations, Aggregator, BatchReport, BatchRunner, CdsCredentials,
    CdsSource, DataLayout, GridSource, LocationSet, RetryPolicy, RunConfig, RunEvent, DEBUG_LIMIT,
    MM_PER_METRE,
};
use log::warn;
use tokio_util::sync::CancellationToken;

async fn execute<S: GridSource>(
    runner: BatchRunner<S>,
    locations: &LocationSet,
    cancel: &CancellationToken,
) -> Result<BatchReport> {
    let bar = create_progress_bar(locations.len() as u64, format!("year {}", runner.config().year));
    let report = runner
        .run_with_observer(locations, cancel, |event| match event {
            RunEvent::Started { total, skipped } => {
                bar.set_length(total as u64);
                bar.inc(skipped as u64);
            }
            RunEvent::Finished(outcome) => {
                bar.set_message(format!("location {}", outcome.id));
                bar.inc(1);
            }
        })
        .await;
    bar.finish_and_clear();
    Ok(report?)
}

fn print_report(report: &BatchReport, dry_run: bool) {
    if dry_run {
        println!(
            "{} location(s) missing, {} already completed, {} cell(s) to download",
            report.missing.len(),
            report.skipped,
            report.cells_to_fetch
        );
    } else {
        println!(
            "Succeeded: {}, failed: {}, skipped (already completed): {}",
            report.succeeded, report.failed, report.skipped
        );
        for (id, kind, reason) in report.failures() {
            println!("  {} failed ({}): {}", id, kind, reason);
        }
        if report.interrupted {
            println!("Interrupted; rerun with --resume to continue");
        }
    }
    println!("Missing-locations report: {}", report.missing_report.display());
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let data_root = match cli.data_dir {
        Some(dir) => dir,
        None => get_default_data_dir().context("resolving the default data directory")?,
    };
    let locations = load_locations(&cli.input).await?;
    let config = RunConfig::builder()
        .data_root(data_root.clone())
        .year(cli.year)
        .maybe_limit(cli.debug.then_some(DEBUG_LIMIT))
        .resume(cli.resume)
        .dry_run(cli.dry_run)
        .retry(RetryPolicy::builder().max_attempts(cli.max_attempts).build())
        .aggregator(Aggregator::new(MM_PER_METRE, cli.days_in_month))
        .build();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current location");
            on_interrupt.cancel();
        }
    });

    let download_dir = DataLayout::new(&data_root, cli.year).temp_dir();
    let report = match CdsCredentials::load() {
        Ok(credentials) => {
            let source = CdsSource::new(credentials, &download_dir);
            execute(BatchRunner::new(source, config), &locations, &cancel).await?
        }
        Err(e) if cli.dry_run => {
            warn!("{}; continuing dry run without upstream access", e);
            execute(BatchRunner::new(OfflineSource, config), &locations, &cancel).await?
        }
        Err(e) => return Err(era5_precip::PrecipError::from(e)).context("loading CDS credentials"),
    };

    print_report(&report, cli.dry_run);
    Ok(())
}
