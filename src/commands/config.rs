use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use chainlog::config::{ApiConfigUpdate, ConfigUpdate, load_or_default};

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub bind_addr: Option<String>,

    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    #[arg(long)]
    pub list_page_size: Option<usize>,

    #[arg(long = "page-limit")]
    pub page_limit: Option<usize>,

    /// Stop ingestion at the first counter integrity fault
    #[arg(long = "halt-on-integrity-fault", value_name = "BOOL")]
    pub halt_on_integrity_fault: Option<bool>,

    /// Enable or disable the GraphQL endpoint
    #[arg(long, value_name = "BOOL")]
    pub graphql: Option<bool>,

    /// Enable or disable `POST /events`
    #[arg(long, value_name = "BOOL")]
    pub rest: Option<bool>,
}

pub fn execute(config_path: Option<PathBuf>, args: ConfigArgs) -> Result<()> {
    let (mut config, path) = load_or_default(config_path)?;

    let ConfigArgs {
        port,
        bind_addr,
        data_dir,
        list_page_size,
        page_limit,
        halt_on_integrity_fault,
        graphql,
        rest,
    } = args;

    let api = ApiConfigUpdate { graphql, rest };
    config.apply_update(ConfigUpdate {
        port,
        bind_addr,
        data_dir,
        list_page_size,
        page_limit,
        halt_on_integrity_fault,
        api: (!api.is_empty()).then_some(api),
    });

    config.validate()?;
    config.ensure_data_dir()?;
    config.save(&path)?;

    tracing::info!("Configuration saved to {}", path.display());
    println!("Configuration saved to {}", path.display());
    Ok(())
}
