//! `dataq run` and `dataq step`

use anyhow::Result;
use dataq_worker::{event_channel, Event};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::context::Context;

/// Run the worker until Ctrl-C, or until idle with `until_idle`.
pub async fn run(ctx: &Context, until_idle: bool, print_events: bool) -> Result<()> {
    let mut worker = ctx.worker();
    let printer = if print_events {
        let (sink, mut stream) = event_channel();
        worker = worker.with_events(sink);
        Some(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                print_event(&event);
            }
        }))
    } else {
        None
    };

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing in-flight tasks");
            stopper.cancel();
        }
    });

    let result = if until_idle {
        worker.drain(cancel).await
    } else {
        worker.run(cancel).await
    };
    signals.abort();

    // Dropping the worker drops the last event sink and ends the printer
    drop(worker);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    result?;
    let stats = ctx.queue.stats().await?;
    println!(
        "pending={} processing={} complete={} failed={}",
        stats.pending, stats.processing, stats.complete, stats.failed
    );
    Ok(())
}

fn print_event(event: &Event) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to encode event: {}", e),
    }
}

/// Process a single pending task and report its final state.
pub async fn step(ctx: &Context) -> Result<()> {
    let worker = ctx.worker();
    match worker.process_single_task().await? {
        None => println!("No pending tasks"),
        Some(task) => {
            if task.error.is_empty() {
                println!("{} {} ({})", task.id, task.status, task.plugin_id);
            } else {
                println!(
                    "{} {} ({}): {}",
                    task.id, task.status, task.plugin_id, task.error
                );
            }
        }
    }
    Ok(())
}
