use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use chainlog::{
    config::{ConfigUpdate, load_or_default},
    server,
};

use crate::logging;

#[derive(Args, Clone, Default)]
pub struct StartArgs {
    /// Override the configured server port
    #[arg(long)]
    pub port: Option<u16>,

    /// Override the configured bind address
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Override the configured data directory
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Stop ingestion at the first counter integrity fault
    #[arg(long)]
    pub halt_on_integrity_fault: bool,
}

pub async fn execute(config_path: Option<PathBuf>, args: StartArgs) -> Result<()> {
    let (mut config, _) = load_or_default(config_path)?;
    config.apply_update(ConfigUpdate {
        port: args.port,
        bind_addr: args.bind_addr,
        data_dir: args.data_dir,
        halt_on_integrity_fault: args.halt_on_integrity_fault.then_some(true),
        ..ConfigUpdate::default()
    });
    config.validate()?;
    config.ensure_data_dir()?;

    logging::init(&config.log_dir())?;
    tracing::info!(
        "configuration loaded; starting server (pid={})",
        std::process::id()
    );
    server::run(config).await?;
    Ok(())
}
