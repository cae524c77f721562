use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use clap::{Args, Subcommand};

use chainlog::{
    client::{IndexClient, RemoteLogFilter},
    config::{Config, DEFAULT_REMOTE_TIMEOUT_SECS, RemoteConfig, load_or_default},
    history::{HistoryRecord, RecordStatus, merge_history},
    model::{Address, Severity},
};

use super::{print_json, read_json_file};

#[derive(Subcommand)]
pub enum RemoteCommands {
    /// Register a remote indexer
    Add(RemoteAddArgs),
    /// Remove a remote indexer
    #[command(name = "rm")]
    Remove(RemoteNameArgs),
    /// List configured remotes
    #[command(name = "ls")]
    List(RemoteListArgs),
    /// Show details for a remote
    Show(RemoteNameArgs),
    /// Fetch log history from a remote, merged with locally pending records
    Logs(RemoteLogsArgs),
    /// Fetch global statistics from a remote
    Stats(RemoteNameArgs),
    /// Show a remote's ingest cursor
    Status(RemoteNameArgs),
}

#[derive(Args)]
pub struct RemoteAddArgs {
    /// Remote alias (e.g. mainnet)
    pub name: String,
    /// GraphQL endpoint (e.g. http://10.0.0.1:7080/graphql)
    pub endpoint: String,
    /// Request timeout in seconds
    #[arg(long = "timeout", default_value_t = DEFAULT_REMOTE_TIMEOUT_SECS)]
    pub timeout_secs: u64,
    /// Replace existing remote with the same name
    #[arg(long, default_value_t = false)]
    pub replace: bool,
}

#[derive(Args)]
pub struct RemoteNameArgs {
    /// Remote alias
    pub name: String,
}

#[derive(Args, Default)]
pub struct RemoteListArgs {
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct RemoteLogsArgs {
    /// Remote alias
    pub name: String,
    #[arg(long)]
    pub creator: Option<String>,
    #[arg(long)]
    pub category: Option<String>,
    #[arg(long)]
    pub level: Option<String>,
    #[arg(long, value_name = "BOOL")]
    pub active: Option<bool>,
    #[arg(long)]
    pub first: Option<usize>,
    #[arg(long)]
    pub skip: Option<usize>,
    /// Case-insensitive text filter over message, category and creator
    #[arg(long)]
    pub search: Option<String>,
    /// JSON file of locally submitted records not yet indexed
    #[arg(long)]
    pub pending: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn execute(config_path: Option<PathBuf>, command: RemoteCommands) -> Result<()> {
    match command {
        RemoteCommands::Add(args) => add_remote(config_path, args),
        RemoteCommands::Remove(args) => remove_remote(config_path, args),
        RemoteCommands::List(args) => list_remotes(config_path, args.json),
        RemoteCommands::Show(args) => show_remote(config_path, args),
        RemoteCommands::Logs(args) => remote_logs(config_path, args).await,
        RemoteCommands::Stats(args) => remote_stats(config_path, args).await,
        RemoteCommands::Status(args) => remote_status(config_path, args).await,
    }
}

fn add_remote(config_path: Option<PathBuf>, args: RemoteAddArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    let name = args.name.trim();
    if name.is_empty() {
        bail!("remote name cannot be empty");
    }

    let endpoint = args.endpoint.trim();
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        bail!("remote endpoint must be an http(s) URL, got '{}'", endpoint);
    }
    if args.timeout_secs == 0 {
        bail!("remote timeout must be at least one second");
    }

    if config.remotes.contains_key(name) && !args.replace {
        bail!(
            "remote '{}' already exists (use --replace to overwrite)",
            name
        );
    }

    config.remotes.insert(
        name.to_string(),
        RemoteConfig {
            endpoint: endpoint.to_string(),
            timeout_secs: args.timeout_secs,
        },
    );
    config.updated_at = Utc::now();
    config.save(&path)?;

    println!("Remote '{}' set to endpoint {}", name, endpoint);
    Ok(())
}

fn remove_remote(config_path: Option<PathBuf>, args: RemoteNameArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;
    let name = args.name.trim();
    if name.is_empty() {
        bail!("remote name cannot be empty");
    }

    if config.remotes.remove(name).is_some() {
        config.updated_at = Utc::now();
        config.save(&path)?;
        println!("Removed remote '{}'", name);
    } else {
        bail!("no remote named '{}' is configured", name);
    }
    Ok(())
}

fn list_remotes(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    if json {
        return print_json(&config.remotes);
    }
    if config.remotes.is_empty() {
        println!("(no remotes configured)");
        return Ok(());
    }
    for (name, remote) in &config.remotes {
        println!("{} {}", name, remote.endpoint);
    }
    Ok(())
}

fn show_remote(config_path: Option<PathBuf>, args: RemoteNameArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let remote = lookup(&config, &args.name)?;

    println!("name: {}", args.name.trim());
    println!("endpoint: {}", remote.endpoint);
    println!("timeout_secs: {}", remote.timeout_secs);
    Ok(())
}

async fn remote_logs(config_path: Option<PathBuf>, args: RemoteLogsArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let client = connect(lookup(&config, &args.name)?)?;

    let filter = RemoteLogFilter {
        creator: args.creator.as_deref().map(Address::parse).transpose()?,
        category: args.category,
        level: args
            .level
            .as_deref()
            .map(|level| level.parse::<Severity>().map_err(|err| anyhow!(err)))
            .transpose()?,
        active: args.active,
    };

    let local: Vec<HistoryRecord> = match &args.pending {
        Some(path) => read_json_file(path)?,
        None => Vec::new(),
    };

    let fetched = client.log_entries(&filter, args.first, args.skip).await?;
    let mut confirmed = Vec::with_capacity(fetched.len());
    for log in fetched {
        let id = log.id.clone();
        let record = HistoryRecord::try_from(log)
            .map_err(|err| anyhow!("remote returned malformed log id '{}': {}", id, err))?;
        confirmed.push(record);
    }

    let merged = merge_history(local, confirmed, args.search.as_deref());
    if args.json {
        return print_json(&merged);
    }
    if merged.is_empty() {
        println!("(no log entries)");
        return Ok(());
    }
    for record in &merged {
        let id = record
            .log_id
            .map(|id| format!("#{id}"))
            .unwrap_or_else(|| "-".to_string());
        let marker = match record.status {
            RecordStatus::Pending => " (pending)",
            RecordStatus::Confirmed => "",
        };
        println!(
            "{} [{}] {} {} {}{}: {}",
            id,
            record.level,
            record.timestamp,
            record.creator,
            record.category,
            marker,
            record.message
        );
    }
    Ok(())
}

async fn remote_stats(config_path: Option<PathBuf>, args: RemoteNameArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let client = connect(lookup(&config, &args.name)?)?;
    print_json(&client.global_stats().await?)
}

async fn remote_status(config_path: Option<PathBuf>, args: RemoteNameArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let client = connect(lookup(&config, &args.name)?)?;
    print_json(&client.indexer_status().await?)
}

fn lookup<'a>(config: &'a Config, name: &str) -> Result<&'a RemoteConfig> {
    let name = name.trim();
    if name.is_empty() {
        bail!("remote name cannot be empty");
    }
    config
        .remotes
        .get(name)
        .ok_or_else(|| anyhow!("no remote named '{}' is configured", name))
}

fn connect(remote: &RemoteConfig) -> Result<IndexClient> {
    Ok(IndexClient::new(
        remote.endpoint.clone(),
        Duration::from_secs(remote.timeout_secs),
    )?)
}
