//! `dataq cas ls|cat|put`

use anyhow::{Context as _, Result};
use dataq_cas::collect_hashes;
use dataq_protocol::{decode_message, DataItem};
use std::io::Write;
use std::path::Path;

use crate::cli::context::Context;
use crate::cli::output::{format_size, print_table};

pub async fn ls(ctx: &Context) -> Result<()> {
    let mut hashes = collect_hashes(ctx.cas.as_ref()).await?;
    if hashes.is_empty() {
        println!("CAS is empty");
        return Ok(());
    }
    hashes.sort_by(|a, b| a.as_str().cmp(b.as_str()));

    let mut rows = Vec::with_capacity(hashes.len());
    for hash in &hashes {
        let raw = ctx.cas.retrieve(hash.as_str()).await?;
        // Entries written by the worker are items; anything else shows as raw bytes
        let (kind, source) = match decode_message::<DataItem>(&raw) {
            Ok(item) => (item.kind, item.source_id),
            Err(_) => ("-".to_string(), "-".to_string()),
        };
        rows.push(vec![
            hash.to_string(),
            format_size(raw.len() as u64),
            kind,
            source,
        ]);
    }
    print_table(&["HASH", "SIZE", "KIND", "SOURCE"], rows);
    println!("{} entr{}", hashes.len(), if hashes.len() == 1 { "y" } else { "ies" });
    Ok(())
}

pub async fn cat(ctx: &Context, hash: &str, raw: bool) -> Result<()> {
    let content = ctx
        .cas
        .retrieve(hash)
        .await
        .with_context(|| format!("Failed to read {}", hash))?;

    let bytes = if raw {
        let item: DataItem =
            decode_message(&content).context("Stored content is not a data item")?;
        item.raw_data
    } else {
        content
    };

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes)?;
    stdout.flush()?;
    Ok(())
}

pub async fn put(ctx: &Context, file: &Path) -> Result<()> {
    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let hash = ctx.cas.store(&payload).await?;
    println!("{}", hash);
    Ok(())
}
