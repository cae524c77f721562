pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod graphql;
pub mod history;
pub mod ingest;
pub mod model;
pub mod observability;
pub mod query;
pub mod server;
pub mod store;

pub use error::{IndexError, Result};
pub use event::{ChainEvent, EventEnvelope, EventPosition};
pub use ingest::{ApplyOutcome, BatchFailure, IngestOptions, IngestReport, Ingester};
pub use query::{LogFilter, Page, QueryService};
pub use store::IndexStore;
