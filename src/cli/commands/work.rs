//! Job worker command.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::cli::helpers::{open_db, Pipeline};
use crate::config::Settings;
use crate::events::ProgressBroadcaster;
use crate::jobs::spawn_progress_logger;

/// Spinner showing the latest sheet outcome while a batch runs.
fn spawn_spinner(events: &ProgressBroadcaster) -> (ProgressBar, JoinHandle<()>) {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message("Waiting for jobs...");

    let mut rx = events.subscribe();
    let bar = pb.clone();
    let handle = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(update) => {
                    let progress = update
                        .stats
                        .map(|s| format!("{}/{} sheets", s.processed(), s.total))
                        .unwrap_or_default();
                    let detail = match (update.sheet_id, update.extraction_status) {
                        (Some(sheet), Some(status)) => format!(
                            "sheet {} {} {}",
                            sheet,
                            status.as_str(),
                            update.drawing_number.as_deref().unwrap_or("")
                        ),
                        _ => update.message.unwrap_or_default(),
                    };
                    bar.set_message(format!(
                        "set {} ({}) {}",
                        update.drawing_set_id, progress, detail
                    ));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });
    (pb, handle)
}

/// Run queued jobs until the queue is idle, or forever with `daemon`.
pub async fn cmd_work(
    settings: &Settings,
    workers: usize,
    daemon: bool,
    interval: u64,
) -> anyhow::Result<()> {
    let ctx = open_db(settings)?;
    let pipeline = Pipeline::from_settings(settings, &ctx).await;
    let logger = spawn_progress_logger(&pipeline.events);

    let recovered = pipeline.worker.recover_stale().await?;
    if recovered > 0 {
        println!(
            "{} Recovered {} jobs left running by a stopped worker",
            style("!").yellow(),
            recovered
        );
    }

    let summary = if daemon {
        println!(
            "{} Working with {} workers, polling every {}s (Ctrl-C to stop)",
            style("→").cyan(),
            workers,
            interval
        );
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        pipeline
            .worker
            .run_daemon(workers, Duration::from_secs(interval.max(1)), shutdown)
            .await?
    } else {
        let pending = ctx.jobs().pending_count().await?;
        println!(
            "{} Running {} pending jobs with {} workers",
            style("→").cyan(),
            pending,
            workers
        );
        let (pb, spinner) = spawn_spinner(&pipeline.events);
        let summary = pipeline.worker.run_until_idle(workers).await;
        spinner.abort();
        pb.finish_and_clear();
        summary?
    };

    logger.abort();

    println!(
        "{} {} completed, {} retrying, {} failed",
        style("✓").green(),
        summary.completed,
        summary.retried,
        summary.failed
    );

    let waiting = ctx.jobs().pending_count().await?;
    if waiting > 0 && !daemon {
        println!("  {} jobs are waiting to retry", waiting);
    }
    Ok(())
}
