use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, anyhow};
use chrono::NaiveDate;
use clap::{Args, Subcommand};

use chainlog::{
    config::load_or_default,
    model::Address,
    query::{Page, QueryService},
};

use super::{open_index_read_only, print_json};

#[derive(Subcommand)]
pub enum StatsCommands {
    /// Totals across every log
    Global,
    /// Counters for one address
    User(UserStatsArgs),
    /// Counters for one category
    Category(CategoryStatsArgs),
    /// Per-day rollups, newest first
    Daily(DailyStatsArgs),
    /// Ingest cursor and recent integrity faults
    Status(StatusArgs),
}

#[derive(Args)]
pub struct UserStatsArgs {
    pub address: String,
    /// Also list per-category counters
    #[arg(long, default_value_t = false)]
    pub categories: bool,
}

#[derive(Args)]
pub struct CategoryStatsArgs {
    pub name: String,
}

#[derive(Args)]
pub struct DailyStatsArgs {
    /// First day (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub from: Option<String>,
    /// Last day (YYYY-MM-DD, inclusive)
    #[arg(long)]
    pub to: Option<String>,
    #[arg(long)]
    pub first: Option<usize>,
    #[arg(long)]
    pub skip: Option<usize>,
}

#[derive(Args)]
pub struct StatusArgs {
    /// Number of recent integrity faults to show
    #[arg(long, default_value_t = 10)]
    pub faults: usize,
}

pub fn execute(config_path: Option<PathBuf>, command: StatsCommands) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;
    let store = Arc::new(open_index_read_only(&config)?);
    let service = QueryService::new(store, config.list_page_size, config.page_limit);

    match command {
        StatsCommands::Global => print_json(&service.global_stats()?),
        StatsCommands::User(args) => {
            let address = Address::parse(&args.address)?;
            let user = service
                .user(&address)?
                .ok_or_else(|| anyhow!("no activity recorded for {address}"))?;
            if args.categories {
                let categories = service.user_categories(&address)?;
                print_json(&serde_json::json!({ "user": user, "categories": categories }))
            } else {
                print_json(&user)
            }
        }
        StatsCommands::Category(args) => {
            let category = service
                .category(&args.name)?
                .ok_or_else(|| anyhow!("no logs recorded in category '{}'", args.name))?;
            print_json(&category)
        }
        StatsCommands::Daily(args) => {
            let from = args.from.as_deref().map(parse_day).transpose()?;
            let to = args.to.as_deref().map(parse_day).transpose()?;
            let days = service.daily_range(from, to, Page::new(args.first, args.skip))?;
            print_json(&days)
        }
        StatsCommands::Status(args) => {
            let cursor = service.cursor()?;
            let faults = service.integrity_faults(Page::new(Some(args.faults), None))?;
            print_json(&serde_json::json!({ "cursor": cursor, "faults": faults }))
        }
    }
}

fn parse_day(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .with_context(|| format!("'{value}' is not a YYYY-MM-DD day"))
}
