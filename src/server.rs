use std::{
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
    thread,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{error, info, warn};
use url::Url;

use crate::error::HarnessError;

/// Host and port extracted from a webserver spec string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebServerSpec {
    pub host: String,
    pub port: Option<u16>,
}

/// Parse a webserver spec. A bare `host:port` is treated as http; `http://`,
/// `chrome://` and `file:///` prefixes are accepted; any other explicit
/// scheme is rejected. An empty spec yields `None`.
pub fn parse_webserver_spec(raw: &str) -> Result<Option<WebServerSpec>, HarnessError> {
    if raw.is_empty() {
        return Ok(None);
    }

    let candidate = if raw.starts_with("http://")
        || raw.starts_with("chrome://")
        || raw.starts_with("file:///")
    {
        raw.to_string()
    } else if raw.contains("://") {
        return Err(HarnessError::validation(format!(
            "unable to parse user defined webserver: {raw:?}"
        )));
    } else {
        format!("http://{raw}")
    };

    let url = Url::parse(&candidate).map_err(|err| {
        HarnessError::validation(format!("unable to parse webserver spec {raw:?}: {err}"))
    })?;
    Ok(Some(WebServerSpec {
        host: url.host_str().unwrap_or_default().to_string(),
        port: url.port(),
    }))
}

/// Serves test content out of a document root during local-serving mode.
/// Owned exclusively by the orchestrator; start and stop bracket the run.
pub struct ContentServer {
    host: String,
    port: u16,
    docroot: PathBuf,
    running: Option<RunningServer>,
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl ContentServer {
    pub fn new(host: impl Into<String>, port: u16, docroot: PathBuf) -> Self {
        Self {
            host: host.into(),
            port,
            docroot,
            running: None,
        }
    }

    /// Address the server is bound to while running.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind and start serving. Starting an already-running server returns
    /// the existing address.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if let Some(running) = &self.running {
            return Ok(running.addr);
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<SocketAddr>>();
        let host = self.host.clone();
        let port = self.port;
        let docroot = self.docroot.clone();

        let thread = thread::Builder::new()
            .name("pacer-content-server".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx
                            .send(Err(anyhow!(err).context("Failed to build server runtime")));
                        return;
                    }
                };
                runtime.block_on(async move {
                    let listener = match TcpListener::bind((host.as_str(), port)).await {
                        Ok(listener) => listener,
                        Err(err) => {
                            let _ = ready_tx.send(Err(anyhow!(err).context(format!(
                                "Failed to bind content server at {host}:{port}"
                            ))));
                            return;
                        }
                    };
                    let addr = match listener.local_addr() {
                        Ok(addr) => addr,
                        Err(err) => {
                            let _ = ready_tx.send(
                                Err(anyhow!(err)
                                    .context("Failed to read content server address")),
                            );
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(addr));

                    let router = content_router(docroot);
                    let server = axum::serve(listener, router.into_make_service())
                        .with_graceful_shutdown(async move {
                            let _ = shutdown_rx.await;
                        });
                    if let Err(err) = server.await {
                        error!(error = %err, "content server terminated unexpectedly");
                    }
                });
            })
            .context("Failed to spawn content server thread")?;

        let addr = ready_rx
            .recv()
            .context("Content server thread exited before binding")??;
        info!(addr = %addr, docroot = %self.docroot.display(), "content server started");
        self.running = Some(RunningServer {
            addr,
            shutdown: shutdown_tx,
            thread,
        });
        Ok(addr)
    }

    /// Shut the server down. Stopping a stopped server is a no-op.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let _ = running.shutdown.send(());
        if running.thread.join().is_err() {
            warn!("content server thread panicked during shutdown");
        }
        info!(addr = %running.addr, "content server stopped");
    }
}

impl Drop for ContentServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn content_router(docroot: PathBuf) -> Router {
    Router::new()
        .route("/", get(serve_index))
        .route("/*path", get(serve_file))
        .with_state(Arc::new(docroot))
}

async fn serve_index(State(docroot): State<Arc<PathBuf>>) -> Response {
    serve_path(&docroot, "index.html").await
}

async fn serve_file(
    State(docroot): State<Arc<PathBuf>>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    serve_path(&docroot, &path).await
}

async fn serve_path(docroot: &Path, relative: &str) -> Response {
    let Some(path) = resolve_docroot_path(docroot, relative) else {
        return (StatusCode::BAD_REQUEST, "invalid path").into_response();
    };
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let mut response = Response::new(Body::from(bytes));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type_for(&path)),
            );
            response
        }
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Join a request path onto the docroot, rejecting anything that is not a
/// plain relative component.
fn resolve_docroot_path(docroot: &Path, relative: &str) -> Option<PathBuf> {
    let mut resolved = docroot.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            _ => return None,
        }
    }
    Some(resolved)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("txt") | Some("manifest") => "text/plain",
        _ => "application/octet-stream",
    }
}
