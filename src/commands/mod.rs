use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use chainlog::{config::Config, store::IndexStore};

pub mod config;
pub mod ingest;
pub mod logs;
pub mod remote;
pub mod start;
pub mod stats;

/// Opens the local index for reading. Safe while a server holds the writer.
pub(crate) fn open_index_read_only(config: &Config) -> Result<IndexStore> {
    let path = config.index_store_path();
    if !path.exists() {
        anyhow::bail!(
            "no index found at {} (run `chainlog ingest` or `chainlog start` first)",
            path.display()
        );
    }
    IndexStore::open_read_only(path.clone())
        .with_context(|| format!("failed to open index at {}", path.display()))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn read_json_file<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
}
