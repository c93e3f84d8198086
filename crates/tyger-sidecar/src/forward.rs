//! Single-direction streamer between a named pipe and the buffer data
//! plane, per spec.md §4.F: "For input buffers it reads from the buffer
//! data plane and writes into the pipe; for output buffers the opposite."
//!
//! Grounded on `tyger_dataplane::client`'s `BufferWriter`/`BufferReader`,
//! which already buffer a whole transfer in memory — the sidecar reads (or
//! writes) the pipe's full contents through `tokio::fs::File`, which is
//! itself backed by the blocking-thread-pool `tokio::fs` always uses, so a
//! FIFO's blocking open/read semantics never stall the reactor.

use std::path::Path;

use reqwest::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tyger_dataplane::client::{BufferReader, BufferWriter, DEFAULT_DEGREE_OF_PARALLELISM};

pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The bound buffer is an input to the job container: the sidecar
    /// pulls blocks from the data plane and writes them into the pipe.
    Input,
    /// The bound buffer is an output: the sidecar reads the pipe and
    /// pushes blocks to the data plane.
    Output,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("pipe io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data plane client error: {0}")]
    Client(#[from] tyger_dataplane::client::ClientError),
}

/// Streams between `pipe_path` and the data-plane buffer reachable at
/// `base_url` (already a signed URL when the control plane issued one), in
/// the direction dictated by the buffer's role in the codespec.
pub async fn forward(
    http: Client,
    direction: Direction,
    pipe_path: &Path,
    base_url: &str,
) -> Result<(), ForwardError> {
    match direction {
        Direction::Input => forward_to_pipe(http, pipe_path, base_url).await,
        Direction::Output => forward_from_pipe(http, pipe_path, base_url).await,
    }
}

async fn forward_to_pipe(http: Client, pipe_path: &Path, base_url: &str) -> Result<(), ForwardError> {
    let reader = BufferReader::new(http, base_url, DEFAULT_DEGREE_OF_PARALLELISM);
    let bytes = reader.read_all().await?;
    let mut pipe = tokio::fs::File::create(pipe_path).await?;
    pipe.write_all(&bytes).await?;
    pipe.shutdown().await?;
    Ok(())
}

async fn forward_from_pipe(http: Client, pipe_path: &Path, base_url: &str) -> Result<(), ForwardError> {
    let mut pipe = tokio::fs::File::open(pipe_path).await?;
    let mut bytes = Vec::new();
    pipe.read_to_end(&mut bytes).await?;
    let writer = BufferWriter::new(http, base_url, DEFAULT_DEGREE_OF_PARALLELISM);
    writer.write_all(bytes, DEFAULT_BLOCK_SIZE).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::Direction;

    #[test]
    fn direction_is_copy_and_comparable() {
        assert_eq!(Direction::Input, Direction::Input);
        assert_ne!(Direction::Input, Direction::Output);
    }
}
