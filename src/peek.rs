use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::auth::RegistryAuth;
use crate::blob::RangeBlobReader;
use crate::client::RegistryClient;
use crate::inflate::{IncrementalInflater, GZIP_MAGIC};
use crate::models::LayerDescriptor;
use crate::tar::{TarEntry, TarScanner, BLOCK_SIZE};
use crate::{error, Result};

/// The outcome of peeking one layer: whatever tar entries were visible in
/// the decompressed prefix, plus byte accounting. Content-addressable by the
/// layer digest, which makes cached copies valid forever.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerPeekResult {
    pub digest: String,
    /// Always true: whole layers are never read by design
    pub partial: bool,
    pub bytes_downloaded: u64,
    pub bytes_decompressed: u64,
    pub entries_found: usize,
    pub entries: Vec<TarEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Peeks a single layer: fetch one bounded compressed prefix, inflate what
/// arrived, and scan headers until the buffer stalls.
pub(crate) struct LayerPeekEngine<'a> {
    pub client: &'a RegistryClient,
    pub auth: &'a RegistryAuth,
    pub cancel: &'a CancellationToken,
}

impl LayerPeekEngine<'_> {
    /// For typical Linux layers a 64 KiB prefix exposes dozens to hundreds
    /// of header blocks; the cost floor is one request per uncached layer.
    pub async fn peek(
        &self,
        namespace: &str,
        repository: &str,
        layer: &LayerDescriptor,
        prefix_bytes: u64,
    ) -> Result<LayerPeekResult> {
        ensure!(!self.cancel.is_cancelled(), error::CancelledSnafu);
        let token = self.auth.acquire(namespace, repository).await?;
        let mut reader = RangeBlobReader::new(
            self.client.clone(),
            self.auth.clone(),
            namespace,
            repository,
            &layer.digest,
            token,
            prefix_bytes,
        );

        let chunk = reader.fetch_chunk().await?;
        ensure!(
            chunk.len() >= GZIP_MAGIC.len() && chunk[..2] == GZIP_MAGIC,
            error::NotGzipSnafu
        );

        let mut inflater = IncrementalInflater::new();
        inflater.feed(&chunk)?;
        debug!(
            target: "peek",
            "layer {}: {} compressed bytes inflated to {}",
            layer.short_digest(),
            chunk.len(),
            inflater.bytes_decompressed(),
        );

        if inflater.bytes_decompressed() < BLOCK_SIZE {
            // expected for tiny or barely-started streams, not a failure
            let warning = error::Error::InsufficientData {
                len: inflater.bytes_decompressed(),
            };
            return Ok(LayerPeekResult {
                digest: layer.digest.clone(),
                partial: true,
                bytes_downloaded: reader.bytes_downloaded(),
                bytes_decompressed: inflater.bytes_decompressed() as u64,
                entries_found: 0,
                entries: Vec::new(),
                error: Some(warning.to_string()),
            });
        }

        let mut scanner = TarScanner::collecting();
        let mut entries = Vec::new();
        scanner.scan_into(inflater.current_buffer(), &mut entries);
        debug!(
            target: "peek",
            "layer {}: {} entries visible in the prefix",
            layer.short_digest(),
            entries.len(),
        );

        Ok(LayerPeekResult {
            digest: layer.digest.clone(),
            partial: true,
            bytes_downloaded: reader.bytes_downloaded(),
            bytes_decompressed: inflater.bytes_decompressed() as u64,
            entries_found: entries.len(),
            entries,
            error: None,
        })
    }
}
