/// HTTP server logic
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, instrument};

use crate::api::{
    self, ErrorBody, InferenceRequestWire, InferenceResponseWire, LoadResponseWire, ModelListWire,
};
use crate::endpoints::EndpointManager;
use crate::error::Error;
use crate::parameters::ParameterMap;
use crate::tensor::{ModelMetadata, ServerMetadata};

struct HttpHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// Hosts the endpoint manager and owns the transport listeners.
pub struct Server {
    manager: Arc<EndpointManager>,
    http: Mutex<Option<HttpHandle>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            manager: Arc::new(EndpointManager::new()),
            http: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> Arc<EndpointManager> {
        self.manager.clone()
    }

    /// Start the HTTP listener on `port` (0 picks a free port) and return
    /// the bound address. Idempotent: a second call reports the existing
    /// listener. Must run inside a tokio runtime.
    pub fn start_http(&self, port: u16) -> Result<SocketAddr, Error> {
        let mut guard = self.http.lock();
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.addr);
        }

        let app = router(self.manager.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let server = axum::Server::try_bind(&addr)
            .map_err(|err| Error::Connection(format!("failed to bind {addr}: {err}")))?
            .serve(app.into_make_service());
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                error!(%err, "http server error");
            }
        });

        info!(addr = %local_addr, "http server listening");
        *guard = Some(HttpHandle {
            addr: local_addr,
            shutdown: shutdown_tx,
            task,
        });
        Ok(local_addr)
    }

    /// Stop the HTTP listener and join its task. Idempotent.
    pub async fn stop_http(&self) {
        let handle = self.http.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            let _ = handle.task.await;
            info!("http server stopped");
        }
    }

    /// Stop the transports and unload every endpoint.
    pub async fn shutdown(&self) {
        self.stop_http().await;
        self.manager.unload_all();
    }
}

fn router(manager: Arc<EndpointManager>) -> Router {
    Router::new()
        .route("/v2", get(server_metadata))
        .route("/v2/health/live", get(health_live))
        .route("/v2/health/ready", get(health_ready))
        .route("/v2/models", get(model_list))
        .route("/v2/models/:model", get(model_metadata))
        .route("/v2/models/:model/ready", get(model_ready))
        .route("/v2/models/:model/infer", post(model_infer))
        .route("/v2/workers/:name/load", post(worker_load))
        .route("/v2/workers/:name/unload", post(worker_unload))
        .route("/v2/repository/models/:model/load", post(repository_load))
        .route("/v2/repository/models/:model/unload", post(repository_unload))
        .layer(Extension(manager))
}

async fn server_metadata(
    Extension(manager): Extension<Arc<EndpointManager>>,
) -> Json<ServerMetadata> {
    Json(manager.server_metadata())
}

async fn health_live() -> StatusCode {
    StatusCode::OK
}

async fn health_ready() -> StatusCode {
    // the endpoint manager is usable as soon as the listener is up
    StatusCode::OK
}

async fn model_list(Extension(manager): Extension<Arc<EndpointManager>>) -> Json<ModelListWire> {
    Json(ModelListWire {
        models: manager.model_list(),
    })
}

async fn model_ready(
    Path(model): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
) -> StatusCode {
    if manager.model_ready(&model) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn model_metadata(
    Path(model): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
) -> Result<Json<ModelMetadata>, (StatusCode, Json<ErrorBody>)> {
    let metadata = manager.model_metadata(&model)?;
    Ok(Json(metadata))
}

#[instrument(skip(manager, wire), fields(id = %wire.id))]
async fn model_infer(
    Path(model): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
    Json(wire): Json<InferenceRequestWire>,
) -> Result<Json<InferenceResponseWire>, (StatusCode, Json<ErrorBody>)> {
    let mut request = api::request_from_wire(wire)?;

    let (response_tx, response_rx) = oneshot::channel();
    request.set_callback(Box::new(move |response| {
        let _ = response_tx.send(response);
    }));
    manager.infer(&model, request)?;

    let response = response_rx
        .await
        .map_err(|_| Error::Runtime("response channel closed before completion".to_string()))?;
    let wire = api::response_to_wire(&response)?;
    Ok(Json(wire))
}

async fn worker_load(
    Path(name): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
    parameters: Option<Json<ParameterMap>>,
) -> Result<Json<LoadResponseWire>, (StatusCode, Json<ErrorBody>)> {
    let parameters = parameters.map(|Json(parameters)| parameters).unwrap_or_default();
    let endpoint = manager.worker_load(&name, &parameters)?;
    Ok(Json(LoadResponseWire { endpoint }))
}

async fn worker_unload(
    Path(name): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
) -> StatusCode {
    manager.worker_unload(&name);
    StatusCode::OK
}

async fn repository_load(
    Path(model): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
    parameters: Option<Json<ParameterMap>>,
) -> Result<Json<LoadResponseWire>, (StatusCode, Json<ErrorBody>)> {
    let parameters = parameters.map(|Json(parameters)| parameters).unwrap_or_default();
    let endpoint = manager.model_load(&model, &parameters)?;
    Ok(Json(LoadResponseWire { endpoint }))
}

async fn repository_unload(
    Path(model): Path<String>,
    Extension(manager): Extension<Arc<EndpointManager>>,
) -> StatusCode {
    manager.model_unload(&model);
    StatusCode::OK
}

/// Shutdown signal handler
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("signal received, starting graceful shutdown");
}

/// Convert to Axum supported formats
impl From<Error> for (StatusCode, Json<ErrorBody>) {
    fn from(err: Error) -> Self {
        let status_code = match err {
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Error::FileNotFound(_) => StatusCode::NOT_FOUND,
            Error::FileRead(_) => StatusCode::BAD_REQUEST,
            Error::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::External(_) | Error::BadStatus(_) | Error::Runtime(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (
            status_code,
            Json(ErrorBody {
                error: err.to_string(),
            }),
        )
    }
}
