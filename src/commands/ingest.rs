use std::{
    io::{self, Read},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use clap::Args;

use chainlog::{
    config::{Config, load_or_default},
    event::{EventEnvelope, parse_event_stream},
    ingest::{IngestOptions, IngestReport, Ingester},
    store::IndexStore,
};

use super::print_json;

#[derive(Args)]
pub struct IngestArgs {
    /// Read events from a file (JSON array or newline-delimited JSON); stdin when omitted
    #[arg(long, short = 'f')]
    pub file: Option<PathBuf>,

    /// Send the events to the running server's `/events` endpoint instead of
    /// opening the index directly
    #[arg(long, default_value_t = false)]
    pub server: bool,

    /// Stop at the first counter integrity fault
    #[arg(long, default_value_t = false)]
    pub halt_on_integrity_fault: bool,

    /// Emit the ingest report as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

pub async fn execute(config_path: Option<PathBuf>, args: IngestArgs) -> Result<()> {
    let (config, _) = load_or_default(config_path)?;

    let input = match &args.file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read events from {}", path.display()))?,
        None => {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read events from stdin")?;
            buffer
        }
    };
    let events = parse_event_stream(&input)?;
    if events.is_empty() {
        println!("no events to ingest");
        return Ok(());
    }

    let report = if args.server {
        post_to_server(&config, &events).await?
    } else {
        let options = IngestOptions {
            halt_on_integrity_fault: args.halt_on_integrity_fault
                || config.halt_on_integrity_fault,
        };
        config.ensure_data_dir()?;
        let path = config.index_store_path();
        let store = IndexStore::open(path.clone()).with_context(|| {
            format!(
                "failed to open index at {} (is a server running? use --server)",
                path.display()
            )
        })?;
        Ingester::new(&store, options).apply_all(events)?
    };

    if args.json {
        return print_json(&report);
    }
    println!(
        "applied {} events ({} duplicates skipped)",
        report.applied, report.duplicates
    );
    for fault in &report.faults {
        println!(
            "integrity fault at {}: {} {} ({})",
            fault.position, fault.entity, fault.counter, fault.detail
        );
    }
    Ok(())
}

async fn post_to_server(config: &Config, events: &[EventEnvelope]) -> Result<IngestReport> {
    let url = format!("{}/events", config.base_url());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let response = client
        .post(&url)
        .json(events)
        .send()
        .await
        .with_context(|| format!("failed to reach chainlog server at {url}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("server rejected events ({status}): {}", body.trim()));
    }
    Ok(response.json().await?)
}
