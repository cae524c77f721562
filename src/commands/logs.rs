use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};

use chainlog::{
    config::load_or_default,
    model::{Address, LogEntry, Severity},
    query::{LogFilter, Page, QueryService},
    store::SortOrder,
};
use std::sync::Arc;

use super::{open_index_read_only, print_json};

#[derive(Subcommand)]
pub enum LogsCommands {
    /// List log entries, newest first
    #[command(name = "ls")]
    List(LogsListArgs),
    /// Show a single log entry
    Get(LogsGetArgs),
}

#[derive(Args)]
pub struct LogsListArgs {
    /// Only entries written by this address
    #[arg(long)]
    pub creator: Option<String>,
    /// Only entries in this category
    #[arg(long)]
    pub category: Option<String>,
    /// Only entries at this severity (name or 0-4)
    #[arg(long)]
    pub level: Option<String>,
    /// Only active (`true`) or deactivated (`false`) entries
    #[arg(long, value_name = "BOOL")]
    pub active: Option<bool>,
    /// Earliest creation timestamp (unix seconds, inclusive)
    #[arg(long)]
    pub from: Option<u64>,
    /// Latest creation timestamp (unix seconds, inclusive)
    #[arg(long)]
    pub to: Option<u64>,
    /// Oldest first
    #[arg(long, default_value_t = false)]
    pub asc: bool,
    /// Page size (capped at the configured page limit)
    #[arg(long)]
    pub first: Option<usize>,
    #[arg(long)]
    pub skip: Option<usize>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct LogsGetArgs {
    pub id: u64,
    /// Include the update history
    #[arg(long, default_value_t = false)]
    pub updates: bool,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub fn execute(config_path: Option<PathBuf>, command: LogsCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = Arc::new(open_index_read_only(&config)?);
    let service = QueryService::new(store, config.list_page_size, config.page_limit);

    match command {
        LogsCommands::List(args) => list_logs(&service, args),
        LogsCommands::Get(args) => get_log(&service, args),
    }
}

fn list_logs(service: &QueryService, args: LogsListArgs) -> Result<()> {
    let filter = LogFilter {
        creator: args.creator.as_deref().map(Address::parse).transpose()?,
        category: args.category,
        level: args
            .level
            .as_deref()
            .map(|level| level.parse::<Severity>().map_err(|err| anyhow!(err)))
            .transpose()?,
        active: args.active,
        from_timestamp: args.from,
        to_timestamp: args.to,
        order: if args.asc {
            SortOrder::Ascending
        } else {
            SortOrder::Descending
        },
    };
    let entries = service.logs(&filter, Page::new(args.first, args.skip))?;

    if args.json {
        return print_json(&entries);
    }
    if entries.is_empty() {
        println!("(no log entries)");
        return Ok(());
    }
    for entry in &entries {
        println!("{}", summary_line(entry));
    }
    Ok(())
}

fn get_log(service: &QueryService, args: LogsGetArgs) -> Result<()> {
    let entry = service
        .log(args.id)?
        .ok_or_else(|| anyhow!("log entry {} not found", args.id))?;
    let updates = if args.updates {
        service.log_updates(args.id, Page::new(Some(service.page_limit()), None))?
    } else {
        Vec::new()
    };

    if args.json {
        return print_json(&serde_json::json!({ "entry": entry, "updates": updates }));
    }
    println!("{}", summary_line(&entry));
    if let Some(metadata) = &entry.metadata {
        println!("  metadata: {metadata}");
    }
    if let Some(hash) = &entry.transaction_hash {
        println!("  tx: {hash}");
    }
    for update in &updates {
        println!(
            "  update #{} by {} at {}: {:?} -> {:?}",
            update.sequence,
            update.updater,
            update.timestamp,
            update.previous_message,
            update.message
        );
    }
    Ok(())
}

fn summary_line(entry: &LogEntry) -> String {
    format!(
        "#{} [{}] {} {} {}{}: {}",
        entry.id,
        entry.level,
        entry.created_at,
        entry.creator,
        entry.category,
        if entry.active { "" } else { " (inactive)" },
        entry.message
    )
}
