//! The parallel writer/reader used by the buffer sidecar (and directly by
//! tests) to stream bytes through the block protocol over HTTP.
//!
//! Grounded on the bounded-concurrency `tokio::sync::Semaphore` idiom used
//! for the corpus's prefix-sharded listing fan-out (spec.md §5 "Batching"),
//! generalized here to bound in-flight PUT/GET requests at a writer- or
//! reader-chosen degree of parallelism `D`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use tokio::sync::Semaphore;

use crate::protocol::{self, BlobName, CHAIN_SEED};

pub const DEFAULT_DEGREE_OF_PARALLELISM: usize = 16;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("block {0} missing after .end reported {1} blocks")]
    MissingBlock(u64, u64),
    #[error("integrity check failed on block {0}")]
    IntegrityFailed(u64),
    #[error("buffer entered a failed state before .end was written")]
    BufferFailed,
}

pub struct BufferWriter {
    http: Client,
    base_url: String,
    degree_of_parallelism: usize,
}

struct ChainedBlock {
    index: u64,
    body: Bytes,
    content_md5_b64: String,
    chain_b64: String,
}

impl BufferWriter {
    pub fn new(http: Client, base_url: impl Into<String>, degree_of_parallelism: usize) -> Self {
        Self { http, base_url: base_url.into(), degree_of_parallelism: degree_of_parallelism.max(1) }
    }

    /// Buffers `source` into blocks no larger than `block_size`, computes
    /// the hash chain sequentially (each block's chain depends on the
    /// previous one), then dispatches the resulting PUTs with up to `D`
    /// concurrent requests in flight — transmission order need not match
    /// chain order since each block carries its own fully-resolved headers.
    pub async fn write_all(&self, source: Vec<u8>, block_size: usize) -> Result<(), ClientError> {
        let blocks = chunk_and_chain(&source, block_size.max(1));
        self.dispatch_blocks(blocks).await?;
        self.write_end(blocks_len(&source, block_size.max(1))).await
    }

    async fn dispatch_blocks(&self, blocks: Vec<ChainedBlock>) -> Result<(), ClientError> {
        let semaphore = Arc::new(Semaphore::new(self.degree_of_parallelism));
        let mut in_flight = FuturesUnordered::new();

        for block in blocks {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let http = self.http.clone();
            let url = format!("{}/{}", self.base_url, block.index);
            in_flight.push(async move {
                let _permit = permit;
                http.put(url)
                    .header("Content-MD5", block.content_md5_b64)
                    .header("X-Hash-Chain", block.chain_b64)
                    .body(block.body)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map(|_| ())
            });
        }

        while let Some(result) = in_flight.next().await {
            result?;
        }
        Ok(())
    }

    async fn write_end(&self, block_count: u64) -> Result<(), ClientError> {
        let payload = serde_json::json!({ "blockCount": block_count }).to_string();
        let body = Bytes::from(payload);
        let url = format!("{}/.end", self.base_url);
        self.http
            .put(url)
            .header("Content-MD5", protocol::md5_base64(&body))
            .header("X-Hash-Chain", protocol::chain_base64(&CHAIN_SEED))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn chunk_and_chain(source: &[u8], block_size: usize) -> Vec<ChainedBlock> {
    let mut chain = CHAIN_SEED;
    let mut blocks = Vec::new();
    for (index, chunk) in source.chunks(block_size).enumerate() {
        let body = Bytes::copy_from_slice(chunk);
        let md5 = protocol::md5_of(&body);
        chain = protocol::chain_next(&chain, &md5);
        blocks.push(ChainedBlock {
            index: index as u64,
            content_md5_b64: protocol::md5_base64(&body),
            chain_b64: protocol::chain_base64(&chain),
            body,
        });
    }
    blocks
}

fn blocks_len(source: &[u8], block_size: usize) -> u64 {
    source.chunks(block_size).count() as u64
}

pub struct BufferReader {
    http: Client,
    base_url: String,
    degree_of_parallelism: usize,
}

impl BufferReader {
    pub fn new(http: Client, base_url: impl Into<String>, degree_of_parallelism: usize) -> Self {
        Self { http, base_url: base_url.into(), degree_of_parallelism: degree_of_parallelism.max(1) }
    }

    /// Reads the whole stream into memory, verifying MD5 and the hash chain
    /// per block as they arrive, reassembled in order regardless of
    /// completion order of the underlying concurrent GETs.
    pub async fn read_all(&self) -> Result<Vec<u8>, ClientError> {
        let block_count = self.read_end_block_count().await?;

        let semaphore = Arc::new(Semaphore::new(self.degree_of_parallelism));
        let mut fetches = FuturesUnordered::new();
        for index in 0..block_count {
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            let http = self.http.clone();
            let url = format!("{}/{}", self.base_url, index);
            fetches.push(async move {
                let _permit = permit;
                let fetched = fetch_with_retry(&http, &url, block_count).await?;
                Ok::<(u64, FetchedBlock), ClientError>((index, fetched))
            });
        }

        let mut bodies: Vec<Option<FetchedBlock>> = (0..block_count).map(|_| None).collect();
        while let Some(result) = fetches.next().await {
            let (index, fetched) = result?;
            bodies[index as usize] = Some(fetched);
        }

        // Re-derive the chain from the bytes actually received and compare it
        // against the `X-Hash-Chain` the server sent back with each block —
        // the server already validated the chain on write, but the client
        // MUST re-verify on read per spec.md §4.B, since the bytes in flight
        // could have been tampered with or truncated after that.
        let mut chain = CHAIN_SEED;
        let mut out = Vec::new();
        for (index, fetched) in bodies.into_iter().enumerate() {
            let index = index as u64;
            let fetched = fetched.ok_or(ClientError::MissingBlock(index, block_count))?;
            let computed_md5 = protocol::md5_of(&fetched.body);
            if fetched.content_md5_b64.as_deref() != Some(protocol::md5_base64(&fetched.body).as_str()) {
                return Err(ClientError::IntegrityFailed(index));
            }
            chain = protocol::chain_next(&chain, &computed_md5);
            if fetched.chain_b64.as_deref() != Some(protocol::chain_base64(&chain).as_str()) {
                return Err(ClientError::IntegrityFailed(index));
            }
            out.extend_from_slice(&fetched.body);
        }
        Ok(out)
    }

    async fn read_end_block_count(&self) -> Result<u64, ClientError> {
        let url = format!("{}/.end", self.base_url);
        let fetched = fetch_with_retry(&self.http, &url, 0).await?;
        let value: serde_json::Value = serde_json::from_slice(&fetched.body).unwrap_or_default();
        Ok(value.get("blockCount").and_then(|v| v.as_u64()).unwrap_or(0))
    }
}

struct FetchedBlock {
    body: Bytes,
    content_md5_b64: Option<String>,
    chain_b64: Option<String>,
}

/// Retries a transient GET failure (including a 404 for a block that hasn't
/// landed yet) with jittered backoff, per spec.md §4.B's parallel-read
/// protocol — bounded in practice by the caller already having observed
/// `.end`, which fixes the maximum valid block index. Carries the
/// `Content-MD5`/`X-Hash-Chain` response headers back so the caller can
/// re-verify them against the bytes it actually received.
async fn fetch_with_retry(http: &Client, url: &str, block_count: u64) -> Result<FetchedBlock, ClientError> {
    let mut attempt = 0u32;
    loop {
        match http.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let content_md5_b64 = resp.headers().get("Content-MD5").and_then(|v| v.to_str().ok()).map(str::to_string);
                let chain_b64 = resp.headers().get("X-Hash-Chain").and_then(|v| v.to_str().ok()).map(str::to_string);
                let body = resp.bytes().await?;
                return Ok(FetchedBlock { body, content_md5_b64, chain_b64 });
            }
            Ok(_) if attempt >= 5 => return Err(ClientError::MissingBlock(0, block_count)),
            Ok(_) => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(20 * (1 << attempt.min(6)))).await;
            }
            Err(e) => return Err(ClientError::Http(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_and_chain_matches_incremental_chaining() {
        let source = b"Paul".to_vec();
        let blocks = chunk_and_chain(&source, 2);
        assert_eq!(blocks.len(), 2);

        let chain0 = protocol::chain_next(&CHAIN_SEED, &protocol::md5_of(b"Pa"));
        let chain1 = protocol::chain_next(&chain0, &protocol::md5_of(b"ul"));
        assert_eq!(blocks[0].chain_b64, protocol::chain_base64(&chain0));
        assert_eq!(blocks[1].chain_b64, protocol::chain_base64(&chain1));
    }
}
