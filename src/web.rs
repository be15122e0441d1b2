use crate::{
    app::{App, AppError, ItemDetails, Stats},
    catalog::{ItemId, TagCategory},
    search::{SearchRequest, SearchResponse},
    task_runner::QueueDump,
};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::{signal, sync::RwLock};

#[derive(Clone)]
pub struct SharedState {
    app: Arc<RwLock<App>>,
}

pub fn router(app: Arc<RwLock<App>>) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/api/search", post(search))
        .route("/api/photos/process", post(process))
        .route("/api/photos/:id", get(details))
        .route("/api/photos/:id/thumbnail", get(thumbnail))
        .route("/api/stats", get(stats))
        .route("/api/categories", get(categories))
        .route("/api/task_queue", get(task_queue))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn shutdown_signal(app: Arc<RwLock<App>>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let mut app = app.write().await;
    tokio::task::block_in_place(|| {
        app.interrupt();

        // join on queue thread handle
        log::warn!("waiting for queues to stop");
        app.wait_task_queue_finish();
    });
}

async fn start_app(app: App) -> anyhow::Result<()> {
    let addr = app.config().server.addr.clone();
    let app = Arc::new(RwLock::new(app));

    let signal = shutdown_signal(app.clone());
    let router = router(app);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await?;

    Ok(())
}

/// Serves the API until SIGINT/SIGTERM. `app` must have its queue running.
pub fn start_daemon(app: App) -> anyhow::Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_app(app))
}

#[derive(Debug)]
struct HttpError(AppError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.0 {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::QueueStopped => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Catalog(_)
            | AppError::Pipeline(_)
            | AppError::Scan(_)
            | AppError::IO(_)
            | AppError::Other(_) => {
                log::error!("{self:?}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<AppError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn search(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, HttpError> {
    let app = state.app.clone();

    log::debug!("payload: {payload:?}");

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(app.search(&payload).into())
    })
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessRequest {
    pub ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessResponse {
    pub queued: usize,
}

async fn process(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        for id in &payload.ids {
            app.enqueue(*id)?;
        }

        Ok(ProcessResponse {
            queued: payload.ids.len(),
        }
        .into())
    })
}

async fn details(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<ItemId>,
) -> Result<Json<ItemDetails>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.details(id).map(Into::into).map_err(Into::into)
    })
}

async fn thumbnail(
    State(state): State<Arc<SharedState>>,
    Path(id): Path<ItemId>,
) -> Result<impl IntoResponse, HttpError> {
    let app = state.app.clone();

    let data = tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.thumbnail(id)
    })?
    .ok_or(AppError::NotFound(id))?;

    Ok(([(header::CONTENT_TYPE, "image/webp")], data))
}

async fn stats(State(state): State<Arc<SharedState>>) -> Result<Json<Stats>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        app.stats().map(Into::into).map_err(Into::into)
    })
}

async fn categories(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<TagCategory>>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(app.catalog.categories()?.into())
    })
}

async fn task_queue(State(state): State<Arc<SharedState>>) -> Result<Json<QueueDump>, HttpError> {
    let app = state.app.clone();

    tokio::task::block_in_place(move || {
        let app = app.blocking_read();
        Ok(app.task_queue().into())
    })
}
