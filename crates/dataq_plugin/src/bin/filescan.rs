//! dataq-filescan: emits one `file` item per regular file under a root directory.
//!
//! The root comes from the action's `root` key, then the plugin's configured
//! `root`, then the current directory.

use anyhow::Context;
use dataq_plugin::{serve, Emitter, Plugin};
use dataq_protocol::{Action, Config, DataItem};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

const PLUGIN_ID: &str = "filescan";
const ITEM_KIND: &str = "file";

#[derive(Default)]
struct FileScan {
    root: Option<PathBuf>,
}

impl FileScan {
    fn root_for(&self, action: &Action, config: &Config) -> PathBuf {
        action
            .config
            .get("root")
            .or_else(|| config.get("root"))
            .map(PathBuf::from)
            .or_else(|| self.root.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

impl Plugin for FileScan {
    fn id(&self) -> &str {
        PLUGIN_ID
    }

    fn configure(&mut self, config: &Config) -> anyhow::Result<()> {
        self.root = config.get("root").map(PathBuf::from);
        Ok(())
    }

    fn extract(
        &mut self,
        action: &Action,
        config: &Config,
        out: &mut Emitter<'_>,
    ) -> anyhow::Result<()> {
        let root = self.root_for(action, config);
        if !root.is_dir() {
            anyhow::bail!("root {} is not a directory", root.display());
        }

        for entry in WalkDir::new(&root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    eprintln!("skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            match file_item(entry.path()) {
                Ok(item) => out.item(item)?,
                Err(e) => eprintln!("skipping {}: {:#}", entry.path().display(), e),
            }
        }
        Ok(())
    }
}

fn file_item(path: &Path) -> anyhow::Result<DataItem> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let meta = std::fs::metadata(path)?;

    let mut item = DataItem::new(
        "",
        path.display().to_string(),
        ITEM_KIND,
        content_type(path),
        raw,
    );
    item.timestamp = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    item.metadata.insert("size".into(), meta.len().to_string());
    if let Some(name) = path.file_name() {
        item.metadata
            .insert("name".into(), name.to_string_lossy().into_owned());
    }
    Ok(item)
}

fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" | "md" => "text/plain",
        "csv" => "text/csv",
        "json" => "application/json",
        "yaml" | "yml" => "application/yaml",
        "html" | "htm" => "text/html",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "parquet" => "application/vnd.apache.parquet",
        _ => "application/octet-stream",
    }
}

fn main() -> anyhow::Result<()> {
    serve(FileScan::default()).context("filescan protocol failure")?;
    Ok(())
}
