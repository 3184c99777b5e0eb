//! Queue commands: seed, transform, tasks, stats, recover

use anyhow::Result;
use comfy_table::Color;
use dataq_queue::TaskStatus;
use serde::Serialize;

use crate::cli::context::Context;
use crate::cli::output::{format_time, print_table_colored, status_color, task_work, truncate};

pub async fn seed(ctx: &Context, plugin: Option<&str>) -> Result<()> {
    let seeded = ctx.worker().seed(plugin).await?;
    if seeded.is_empty() {
        println!("No enabled plugins to seed");
    }
    for task in seeded {
        println!("Seeded {} for plugin {}", task.id, task.plugin_id);
    }
    Ok(())
}

pub async fn transform(ctx: &Context, plugin: &str, hash: &str) -> Result<()> {
    let task = ctx.worker().submit_transform(plugin, hash).await?;
    println!("Queued transform {} for plugin {}", task.id, task.plugin_id);
    Ok(())
}

pub async fn list(ctx: &Context, status: Option<TaskStatus>, json: bool) -> Result<()> {
    let tasks = ctx.queue.list(status).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }
    if tasks.is_empty() {
        println!("No tasks");
        return Ok(());
    }

    let rows = tasks
        .iter()
        .map(|task| {
            vec![
                (task.id.clone(), None),
                (task.plugin_id.clone(), None),
                (task.status.to_string(), Some(status_color(task.status))),
                (truncate(&task_work(task), 40), None),
                (format_time(&task.updated_at), None),
                (
                    truncate(&task.error, 60),
                    (!task.error.is_empty()).then_some(Color::Red),
                ),
            ]
        })
        .collect();
    print_table_colored(&["ID", "PLUGIN", "STATUS", "WORK", "UPDATED", "ERROR"], rows);
    println!("{} task(s)", tasks.len());
    Ok(())
}

#[derive(Serialize)]
struct StatsOutput {
    pending: u64,
    processing: u64,
    complete: u64,
    failed: u64,
    total: u64,
}

pub async fn stats(ctx: &Context, json: bool) -> Result<()> {
    let stats = ctx.queue.stats().await?;

    if json {
        let out = StatsOutput {
            pending: stats.pending,
            processing: stats.processing,
            complete: stats.complete,
            failed: stats.failed,
            total: stats.total(),
        };
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let rows = TaskStatus::ALL
        .iter()
        .map(|status| {
            let count = match status {
                TaskStatus::Pending => stats.pending,
                TaskStatus::Processing => stats.processing,
                TaskStatus::Complete => stats.complete,
                TaskStatus::Failed => stats.failed,
            };
            vec![
                (status.to_string(), Some(status_color(*status))),
                (count.to_string(), None),
            ]
        })
        .chain(std::iter::once(vec![
            ("total".to_string(), None),
            (stats.total().to_string(), None),
        ]))
        .collect();
    print_table_colored(&["STATUS", "COUNT"], rows);
    Ok(())
}

pub async fn recover(ctx: &Context) -> Result<()> {
    let recovered = ctx.worker().recover_orphaned().await?;
    if recovered.is_empty() {
        println!("No orphaned tasks");
    } else {
        println!("Marked {} orphaned task(s) failed:", recovered.len());
        for id in recovered {
            println!("  {}", id);
        }
    }
    Ok(())
}
