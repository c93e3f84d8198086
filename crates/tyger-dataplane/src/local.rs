//! On-disk local-mode block store.
//!
//! Layout per spec.md §6: `{dir}/data/{id}/{blob}`,
//! `{dir}/metadata/{id}/{blob}` (JSON sidecar with MD5 and custom metadata),
//! `{dir}/staging/` used for atomic rename. Grounded on the
//! temp-file-then-rename idiom used throughout the corpus for durable writes
//! (e.g. `sem_os_postgres`'s COPY-then-merge staging pattern, generalized to
//! a filesystem write).

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::DataPlaneError;
use crate::protocol::{self, BlobName, CHAIN_SEED};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockMetadata {
    content_md5_b64: String,
    chain_b64: String,
    size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContainerStatus {
    Active,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerMetadata {
    status: ContainerStatus,
}

pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn data_dir(&self, id: &str) -> PathBuf {
        self.root.join("data").join(id)
    }

    fn metadata_dir(&self, id: &str) -> PathBuf {
        self.root.join("metadata").join(id)
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    fn container_metadata_path(&self, id: &str) -> PathBuf {
        self.metadata_dir(id).join(".container.json")
    }

    pub async fn create_container(&self, id: &str) -> Result<(), DataPlaneError> {
        tokio::fs::create_dir_all(self.data_dir(id)).await.map_err(|_| DataPlaneError::ServerBusy)?;
        tokio::fs::create_dir_all(self.metadata_dir(id)).await.map_err(|_| DataPlaneError::ServerBusy)?;
        tokio::fs::create_dir_all(self.staging_dir()).await.map_err(|_| DataPlaneError::ServerBusy)?;
        let meta = ContainerMetadata { status: ContainerStatus::Active };
        self.write_json_atomic(&self.container_metadata_path(id), &meta).await
    }

    pub async fn container_exists(&self, id: &str) -> bool {
        tokio::fs::metadata(self.data_dir(id)).await.is_ok()
    }

    pub async fn mark_container_failed(&self, id: &str) -> Result<(), DataPlaneError> {
        let meta = ContainerMetadata { status: ContainerStatus::Failed };
        self.write_json_atomic(&self.container_metadata_path(id), &meta).await
    }

    async fn container_status(&self, id: &str) -> ContainerStatus {
        match tokio::fs::read(self.container_metadata_path(id)).await {
            Ok(bytes) => serde_json::from_slice::<ContainerMetadata>(&bytes)
                .map(|m| m.status)
                .unwrap_or(ContainerStatus::Active),
            Err(_) => ContainerStatus::Active,
        }
    }

    fn blob_path(&self, dir: &Path, blob: BlobName) -> PathBuf {
        dir.join(blob.to_string())
    }

    async fn read_metadata(&self, id: &str, blob: BlobName) -> Option<BlockMetadata> {
        let path = self.blob_path(&self.metadata_dir(id), blob);
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// The chain value a new block N must fold its own MD5 into: block 0
    /// uses the zero seed, every other block uses the previous numbered
    /// block's recorded chain.
    async fn previous_chain(&self, id: &str, n: u64) -> Result<[u8; 16], DataPlaneError> {
        if n == 0 {
            return Ok(CHAIN_SEED);
        }
        let previous = self
            .read_metadata(id, BlobName::Block(n - 1))
            .await
            .ok_or(DataPlaneError::HashChainMismatch)?;
        protocol::decode_base64_16(&previous.chain_b64).ok_or(DataPlaneError::HashChainMismatch)
    }

    pub async fn write_block(
        &self,
        id: &str,
        blob: BlobName,
        body: Bytes,
        content_md5_b64: &str,
        chain_b64: &str,
    ) -> Result<(), DataPlaneError> {
        if !self.container_exists(id).await {
            return Err(DataPlaneError::ContainerNotFound);
        }

        let data_path = self.blob_path(&self.data_dir(id), blob);
        if tokio::fs::metadata(&data_path).await.is_ok() {
            return Err(DataPlaneError::UnauthorizedBlobOverwrite);
        }

        let previous_chain = match blob {
            BlobName::Block(n) => self.previous_chain(id, n).await?,
            _ => CHAIN_SEED,
        };

        let new_chain = protocol::verify_block(&body, content_md5_b64, chain_b64, &previous_chain)
            .map_err(|e| match e {
                crate::protocol::BlockVerifyError::Md5Mismatch => DataPlaneError::Md5Mismatch,
                crate::protocol::BlockVerifyError::HashChainMismatch => DataPlaneError::HashChainMismatch,
            })?;

        self.atomic_write_file(&data_path, &body).await?;

        let metadata = BlockMetadata {
            content_md5_b64: content_md5_b64.to_string(),
            chain_b64: protocol::chain_base64(&new_chain),
            size: body.len() as u64,
        };
        self.write_json_atomic(&self.blob_path(&self.metadata_dir(id), blob), &metadata).await
    }

    /// Returns `(body, Content-MD5, X-Hash-Chain)` — both headers the writer
    /// originally supplied, so the reader can re-verify without trusting the
    /// bytes on disk (spec.md §4.B "Clients MUST re-verify").
    pub async fn read_block(&self, id: &str, blob: BlobName) -> Result<(Bytes, String, String), DataPlaneError> {
        if !self.container_exists(id).await {
            return Err(DataPlaneError::ContainerNotFound);
        }

        let data_path = self.blob_path(&self.data_dir(id), blob);
        match tokio::fs::read(&data_path).await {
            Ok(bytes) => {
                let metadata = self.read_metadata(id, blob).await;
                let content_md5_b64 = metadata
                    .as_ref()
                    .map(|m| m.content_md5_b64.clone())
                    .unwrap_or_else(|| protocol::md5_base64(&bytes));
                let chain_b64 = metadata.map(|m| m.chain_b64).unwrap_or_default();
                Ok((Bytes::from(bytes), content_md5_b64, chain_b64))
            }
            Err(_) => {
                // Absence of `.end` plus a container marked failed is a
                // writer-abort signal for numbered blocks (spec.md §4.B).
                if !matches!(blob, BlobName::End) && self.container_status(id).await == ContainerStatus::Failed {
                    let end_present = tokio::fs::metadata(self.blob_path(&self.data_dir(id), BlobName::End)).await.is_ok();
                    if !end_present {
                        return Err(DataPlaneError::BufferFailedState);
                    }
                }
                Err(DataPlaneError::BlobNotFound)
            }
        }
    }

    pub async fn blob_exists(&self, id: &str, blob: BlobName) -> bool {
        tokio::fs::metadata(self.blob_path(&self.data_dir(id), blob)).await.is_ok()
    }

    async fn atomic_write_file(&self, dest: &Path, body: &[u8]) -> Result<(), DataPlaneError> {
        let staging_path = self.staging_dir().join(uuid_like());
        {
            let mut f = tokio::fs::File::create(&staging_path).await.map_err(|_| DataPlaneError::ServerBusy)?;
            f.write_all(body).await.map_err(|_| DataPlaneError::ServerBusy)?;
            f.sync_all().await.map_err(|_| DataPlaneError::ServerBusy)?;
        }
        tokio::fs::rename(&staging_path, dest).await.map_err(|_| DataPlaneError::ServerBusy)?;
        Ok(())
    }

    async fn write_json_atomic<T: Serialize>(&self, dest: &Path, value: &T) -> Result<(), DataPlaneError> {
        let json = serde_json::to_vec(value).map_err(|_| DataPlaneError::ServerBusy)?;
        self.atomic_write_file(dest, &json).await
    }
}

fn uuid_like() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    data_encoding::HEXLOWER.encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{chain_base64, chain_next, md5_base64, md5_of};

    async fn store() -> (LocalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        (store, dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips_a_two_block_stream() {
        let (store, _dir) = store().await;
        store.create_container("buf1").await.unwrap();

        let block0 = Bytes::from_static(b"Pa");
        let chain0 = chain_next(&CHAIN_SEED, &md5_of(&block0));
        store
            .write_block("buf1", BlobName::Block(0), block0.clone(), &md5_base64(&block0), &chain_base64(&chain0))
            .await
            .unwrap();

        let block1 = Bytes::from_static(b"ul");
        let chain1 = chain_next(&chain0, &md5_of(&block1));
        store
            .write_block("buf1", BlobName::Block(1), block1.clone(), &md5_base64(&block1), &chain_base64(&chain1))
            .await
            .unwrap();

        let (read0, _, _) = store.read_block("buf1", BlobName::Block(0)).await.unwrap();
        let (read1, _, _) = store.read_block("buf1", BlobName::Block(1)).await.unwrap();
        assert_eq!(read0, block0);
        assert_eq!(read1, block1);
    }

    #[tokio::test]
    async fn duplicate_put_is_rejected_as_unauthorized_overwrite() {
        let (store, _dir) = store().await;
        store.create_container("buf1").await.unwrap();
        let body = Bytes::from_static(b"x");
        let chain = chain_next(&CHAIN_SEED, &md5_of(&body));
        store.write_block("buf1", BlobName::Block(0), body.clone(), &md5_base64(&body), &chain_base64(&chain)).await.unwrap();

        let err = store
            .write_block("buf1", BlobName::Block(0), body.clone(), &md5_base64(&body), &chain_base64(&chain))
            .await
            .unwrap_err();
        assert_eq!(err, DataPlaneError::UnauthorizedBlobOverwrite);
    }

    #[tokio::test]
    async fn put_to_unknown_container_is_container_not_found() {
        let (store, _dir) = store().await;
        let body = Bytes::from_static(b"x");
        let chain = chain_next(&CHAIN_SEED, &md5_of(&body));
        let err = store
            .write_block("nope", BlobName::Block(0), body.clone(), &md5_base64(&body), &chain_base64(&chain))
            .await
            .unwrap_err();
        assert_eq!(err, DataPlaneError::ContainerNotFound);
    }

    #[tokio::test]
    async fn tampered_chain_on_replay_is_rejected_and_block_zero_remains_readable() {
        // spec.md §8 scenario S3.
        let (store, _dir) = store().await;
        store.create_container("buf1").await.unwrap();
        let block0 = Bytes::from_static(b"aa");
        let chain0 = chain_next(&CHAIN_SEED, &md5_of(&block0));
        store
            .write_block("buf1", BlobName::Block(0), block0.clone(), &md5_base64(&block0), &chain_base64(&chain0))
            .await
            .unwrap();

        let block1 = Bytes::from_static(b"bb");
        let bogus_chain = chain_base64(&CHAIN_SEED); // corrupted X-Hash-Chain
        let err = store
            .write_block("buf1", BlobName::Block(1), block1, &md5_base64(b"bb"), &bogus_chain)
            .await
            .unwrap_err();
        assert_eq!(err, DataPlaneError::HashChainMismatch);

        let (read0, _, _) = store.read_block("buf1", BlobName::Block(0)).await.unwrap();
        assert_eq!(read0, block0);
        assert_eq!(store.read_block("buf1", BlobName::Block(1)).await.unwrap_err(), DataPlaneError::BlobNotFound);
    }

    #[tokio::test]
    async fn missing_end_without_failed_status_is_blob_not_found_not_buffer_failed() {
        let (store, _dir) = store().await;
        store.create_container("buf1").await.unwrap();
        let err = store.read_block("buf1", BlobName::End).await.unwrap_err();
        assert_eq!(err, DataPlaneError::BlobNotFound);
    }

    #[tokio::test]
    async fn missing_block_on_failed_container_without_end_is_buffer_failed_state() {
        let (store, _dir) = store().await;
        store.create_container("buf1").await.unwrap();
        store.mark_container_failed("buf1").await.unwrap();
        let err = store.read_block("buf1", BlobName::Block(3)).await.unwrap_err();
        assert_eq!(err, DataPlaneError::BufferFailedState);
    }
}
