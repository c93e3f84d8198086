//! Ephemeral-buffer transport: no data-plane object storage involved, the
//! producer sidecar's pipe contents are served directly over HTTP to the
//! consumer sidecar co-located on the other end of the run, per
//! spec.md §4.F's point-to-point mode. Grounded on the teacher's minimal
//! axum router style (`sem_os_server::router::build_router`'s one-route
//! health endpoint) scaled down to a single GET.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum PointToPointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer closed before data was ready")]
    PeerClosed,
}

struct ServeState {
    body: Vec<u8>,
    done_tx: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

async fn serve_once(State(state): State<Arc<ServeState>>) -> impl IntoResponse {
    if let Some(tx) = state.done_tx.lock().unwrap().take() {
        let _ = tx.send(());
    }
    (StatusCode::OK, state.body.clone())
}

/// Producer side: reads the whole output pipe into memory, then serves it
/// at `GET /data` on `listen_addr` until the one consumer request lands,
/// after which the listener shuts down.
pub async fn serve_pipe_once(pipe_path: &std::path::Path, listen_addr: SocketAddr) -> Result<(), PointToPointError> {
    let mut pipe = tokio::fs::File::open(pipe_path).await?;
    let mut body = Vec::new();
    pipe.read_to_end(&mut body).await?;

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let state = Arc::new(ServeState { body, done_tx: std::sync::Mutex::new(Some(done_tx)) });
    let app = Router::new().route("/data", get(serve_once)).with_state(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = done_rx.await;
        })
        .await?;
    Ok(())
}

/// Consumer side: fetches `GET {peer_url}/data` and writes the response
/// body into the input pipe.
pub async fn fetch_into_pipe(
    http: reqwest::Client,
    peer_url: &str,
    pipe_path: &std::path::Path,
) -> Result<(), PointToPointError> {
    let resp = http.get(format!("{peer_url}/data")).send().await?.error_for_status()?;
    let bytes = resp.bytes().await?;
    let mut pipe = tokio::fs::File::create(pipe_path).await?;
    pipe.write_all(&bytes).await?;
    pipe.shutdown().await?;
    Ok(())
}
