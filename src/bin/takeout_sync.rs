#![deny(warnings)]

use {
    anyhow::Result,
    std::{collections::BTreeMap, fs::File, sync::Arc},
    structopt::StructOpt,
    takeout_sync::{default_workers, sync, Options},
    tracing::info,
    tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer},
};

fn init_logging(options: &Options) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if options.verbose { "debug" } else { "info" }));

    // The log file always carries debug-level detail, independent of the
    // console verbosity.
    let file_layer = options
        .log_file
        .as_deref()
        .map(|path| -> Result<_> {
            Ok(tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(File::create(path)?))
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug")))
        })
        .transpose()?;

    tracing_subscriber::registry()
        .with(file_layer)
        .with(tracing_subscriber::fmt::layer().with_filter(console_filter))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::from_args();

    init_logging(&options)?;

    if options.dry_run {
        info!("dry run -- no files will be modified");
    }

    let workers = options.threads.unwrap_or_else(default_workers);

    let report = sync::run(&options.path, workers, options.dry_run).await?;

    info!(
        "{} files processed: {} updated, {} already in sync, {} failed ({} GPS updates skipped for zero coordinates)",
        report.processed,
        report.updated,
        report.skipped,
        report.failed,
        report.gps_skipped
    );

    if report.failed > 0 {
        let mut by_stage = BTreeMap::new();

        for failure in &report.failures {
            *by_stage.entry(failure.stage.to_string()).or_insert(0_usize) += 1;
        }

        for (stage, count) in by_stage {
            info!("  {} failures during {}", count, stage);
        }

        info!("re-run with --verbose or --log-file for per-file failure detail");
    }

    if options.dry_run && report.updated > 0 {
        info!("re-run without --dry-run to apply these changes");
    }

    Ok(())
}
