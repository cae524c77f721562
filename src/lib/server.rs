use std::{net::SocketAddr, sync::Arc};

use async_graphql::http::GraphQLPlaygroundConfig;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{
    config::{ApiConfig, Config},
    error::{IndexError, Result},
    event::{EventEnvelope, EventPosition},
    graphql::{IndexSchema, build_schema},
    ingest::{BatchFailure, IngestOptions, IngestReport, Ingester},
    observability,
    query::QueryService,
    store::IndexStore,
};

#[derive(Clone)]
pub struct AppState {
    store: Arc<IndexStore>,
    query: QueryService,
    ingest: IngestOptions,
}

impl AppState {
    pub fn new(store: Arc<IndexStore>, config: &Config) -> Self {
        let query = QueryService::new(
            Arc::clone(&store),
            config.list_page_size,
            config.page_limit,
        );
        Self {
            store,
            query,
            ingest: IngestOptions {
                halt_on_integrity_fault: config.halt_on_integrity_fault,
            },
        }
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }
}

pub fn build_router(state: AppState, api: &ApiConfig) -> Result<Router> {
    if !api.any_enabled() {
        return Err(IndexError::Config(
            "at least one API surface (REST or GraphQL) must be enabled".to_string(),
        ));
    }

    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(observability::metrics_handler))
        .with_state(state.clone());

    if api.rest {
        let rest_router = Router::new()
            .route("/events", post(ingest_events))
            .with_state(state.clone());
        app = app.merge(rest_router);
    }

    if api.graphql {
        let graphql_schema = build_schema(state.query.clone());
        let graphql_router = Router::new()
            .route("/graphql", get(graphql_playground).post(graphql_handler))
            .route("/graphql/playground", get(graphql_playground))
            .layer(Extension(graphql_schema));
        app = app.merge(graphql_router);
    }

    Ok(app
        .layer(middleware::from_fn(observability::track_http_metrics))
        .layer(TraceLayer::new_for_http()))
}

pub async fn run(config: Config) -> Result<()> {
    if let Err(err) = observability::init() {
        warn!("metrics exporter unavailable: {err}");
    }

    let store = Arc::new(IndexStore::open(config.index_store_path())?);
    let state = AppState::new(store, &config);
    let app = build_router(state, &config.api)?;

    let addr: SocketAddr = config.listen_addr().parse().map_err(|err| {
        IndexError::Config(format!(
            "invalid bind address {}: {}",
            config.listen_addr(),
            err
        ))
    })?;
    let listener = TcpListener::bind(addr).await?;
    info!(
        "Starting chainlog server on {addr} (graphql={}, rest={})",
        config.api.graphql, config.api.rest
    );

    serve(listener, app).await?;
    info!("chainlog server stopped");
    Ok(())
}

pub async fn serve(listener: TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(IndexError::from)
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>> {
    let cursor = state.query.cursor()?;
    Ok(Json(HealthResponse {
        status: "ok",
        read_only: state.store.is_read_only(),
        block_number: cursor.position.map(|position| position.block_number),
        events_applied: cursor.events_applied,
    }))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    read_only: bool,
    block_number: Option<u64>,
    events_applied: u64,
}

async fn ingest_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<EventEnvelope>>,
) -> Response {
    let count = events.len();
    let store = Arc::clone(&state.store);
    let options = state.ingest;
    let outcome = tokio::task::spawn_blocking(move || {
        Ingester::new(&store, options).apply_batch(events)
    })
    .await;

    match outcome {
        Ok(Ok(report)) => {
            if !report.faults.is_empty() {
                warn!(
                    "ingested {} events with {} integrity faults",
                    count,
                    report.faults.len()
                );
            }
            Json(report).into_response()
        }
        Ok(Err(failure)) => failure.into_response(),
        Err(err) => IndexError::Storage(format!("ingest task failed: {err}")).into_response(),
    }
}

/// Error body for a batch that stopped part-way: the caller learns which
/// event was refused and what was applied before it.
#[derive(Serialize)]
struct BatchFailureBody {
    message: String,
    retryable: bool,
    failed_at: EventPosition,
    report: IngestReport,
}

impl IntoResponse for BatchFailure {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let body = BatchFailureBody {
            message: self.error.to_string(),
            retryable: self.error.is_retryable(),
            failed_at: self.failed_at,
            report: self.report,
        };
        (status, Json(body)).into_response()
    }
}

async fn graphql_handler(
    Extension(schema): Extension<IndexSchema>,
    request: GraphQLRequest,
) -> GraphQLResponse {
    schema.execute(request.into_inner()).await.into()
}

async fn graphql_playground() -> impl IntoResponse {
    Html(async_graphql::http::playground_source(
        GraphQLPlaygroundConfig::new("/graphql"),
    ))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
