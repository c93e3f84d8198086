//! Entry point for the per-buffer sidecar process. One instance runs per
//! bound buffer per job container, configured entirely through environment
//! variables set by the backend that created the container (spec.md §4.F).

use std::net::SocketAddr;
use std::path::PathBuf;

use tyger_sidecar::{ensure_fifo, forward, pipe_path, Direction};

fn required_env(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("required environment variable {name} is not set"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let buffer_name = required_env("TYGER_BUFFER_NAME");
    let direction = match required_env("TYGER_BUFFER_DIRECTION").as_str() {
        "input" => Direction::Input,
        "output" => Direction::Output,
        other => anyhow::bail!("TYGER_BUFFER_DIRECTION must be 'input' or 'output', got '{other}'"),
    };
    let mode = std::env::var("TYGER_BUFFER_MODE").unwrap_or_else(|_| "dataplane".to_string());

    let path: PathBuf = std::env::var("TYGER_BUFFER_PIPE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| pipe_path(&buffer_name));
    ensure_fifo(&path)?;

    tracing::info!(buffer = %buffer_name, direction = ?direction, mode = %mode, path = %path.display(), "sidecar starting");

    match mode.as_str() {
        "dataplane" => {
            let base_url = required_env("TYGER_BUFFER_URL");
            let http = reqwest::Client::new();
            forward(http, direction, &path, &base_url).await?;
        }
        "ephemeral" => match direction {
            Direction::Output => {
                let listen_addr: SocketAddr = required_env("TYGER_EPHEMERAL_LISTEN_ADDR").parse()?;
                tyger_sidecar::point_to_point::serve_pipe_once(&path, listen_addr).await?;
            }
            Direction::Input => {
                let peer_url = required_env("TYGER_EPHEMERAL_PEER_URL");
                let http = reqwest::Client::new();
                tyger_sidecar::point_to_point::fetch_into_pipe(http, &peer_url, &path).await?;
            }
        },
        other => anyhow::bail!("TYGER_BUFFER_MODE must be 'dataplane' or 'ephemeral', got '{other}'"),
    }

    tracing::info!(buffer = %buffer_name, "sidecar finished");
    Ok(())
}
