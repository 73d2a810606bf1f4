use std::time::{Duration, Instant};

use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::auth::RegistryAuth;
use crate::blob::RangeBlobReader;
use crate::client::RegistryClient;
use crate::inflate::{IncrementalInflater, GZIP_MAGIC};
use crate::introspect::ProgressFn;
use crate::models::LayerDescriptor;
use crate::tar::{TarEntry, TarScanner, TargetMatch};
use crate::{error, Result};

/// The outcome of carving one file out of an image. The carved bytes exactly
/// match the matched entry's stored size; writing them anywhere is the
/// caller's concern.
#[derive(Debug, Clone)]
pub struct CarveResult {
    pub entry: TarEntry,
    /// Digest of the layer the file was found in
    pub layer_digest: String,
    /// Compressed size of that layer
    pub layer_size: u64,
    pub data: Vec<u8>,
    /// Bytes fetched across every layer that was searched
    pub bytes_downloaded: u64,
    pub elapsed: Duration,
}

/// Searches an image's layers in base-first order for one target path,
/// fetching each layer chunk by chunk and stopping the moment the target's
/// content bytes are materialized in the decompressed buffer.
pub(crate) struct LayerCarveEngine<'a> {
    pub client: &'a RegistryClient,
    pub auth: &'a RegistryAuth,
    pub cancel: &'a CancellationToken,
}

impl LayerCarveEngine<'_> {
    /// Returns the first occurrence of `target_path` in layer order. Layers
    /// that are not gzip, are corrupt, or fail to download are skipped;
    /// authorization failures and cancellation abort the whole search.
    pub async fn carve(
        &self,
        namespace: &str,
        repository: &str,
        layers: &[LayerDescriptor],
        target_path: &str,
        chunk_size: u64,
        progress: Option<&ProgressFn>,
    ) -> Result<CarveResult> {
        let started = Instant::now();
        let token = self.auth.acquire(namespace, repository).await?;
        let mut bytes_downloaded = 0u64;

        for (index, layer) in layers.iter().enumerate() {
            if let Some(progress) = progress {
                progress("carve", index + 1, layers.len());
            }
            match self
                .carve_layer(
                    namespace,
                    repository,
                    layer,
                    target_path,
                    chunk_size,
                    &token,
                    &mut bytes_downloaded,
                )
                .await
            {
                Ok(Some((entry, data))) => {
                    info!(
                        target: "carve",
                        "found '{target_path}' in layer {} after {bytes_downloaded} bytes",
                        layer.short_digest(),
                    );
                    return Ok(CarveResult {
                        entry,
                        layer_digest: layer.digest.clone(),
                        layer_size: layer.size,
                        data,
                        bytes_downloaded,
                        elapsed: started.elapsed(),
                    });
                }
                Ok(None) => {}
                Err(source) if source.is_fatal() => return Err(source),
                Err(source @ error::Error::FoundButIncomplete { .. }) => return Err(source),
                Err(source) => {
                    debug!(
                        target: "carve",
                        "skipping layer {}: {source}",
                        layer.short_digest(),
                    );
                }
            }
        }

        error::NotFoundSnafu {
            path: target_path.to_string(),
        }
        .fail()
    }

    /// Search one layer. `Ok(None)` means the layer was scanned to
    /// exhaustion without a match; errors are the caller's containment
    /// decision.
    #[allow(clippy::too_many_arguments)]
    async fn carve_layer(
        &self,
        namespace: &str,
        repository: &str,
        layer: &LayerDescriptor,
        target_path: &str,
        chunk_size: u64,
        token: &str,
        bytes_downloaded: &mut u64,
    ) -> Result<Option<(TarEntry, Vec<u8>)>> {
        let mut reader = RangeBlobReader::new(
            self.client.clone(),
            self.auth.clone(),
            namespace,
            repository,
            &layer.digest,
            token.to_string(),
            chunk_size,
        );
        let mut inflater = IncrementalInflater::new();
        let mut scanner = TarScanner::searching(target_path);
        let mut found: Option<TargetMatch> = None;
        let mut first_chunk = true;

        loop {
            ensure!(!self.cancel.is_cancelled(), error::CancelledSnafu);
            let chunk = reader.fetch_chunk().await?;
            if chunk.is_empty() {
                break;
            }
            *bytes_downloaded += chunk.len() as u64;
            if first_chunk {
                first_chunk = false;
                ensure!(
                    chunk.len() >= GZIP_MAGIC.len() && chunk[..2] == GZIP_MAGIC,
                    error::NotGzipSnafu
                );
            }
            inflater.feed(&chunk)?;

            if found.is_none() {
                found = scanner.scan_for(inflater.current_buffer());
                if let Some(target) = &found {
                    debug!(
                        target: "carve",
                        "matched '{}' in layer {} at decompressed offset {}, {} content bytes",
                        target.entry.name,
                        layer.short_digest(),
                        target.content_offset,
                        target.content_len,
                    );
                }
            }
            // once matched, further chunks only grow the buffer
            if let Some(target) = &found {
                if inflater.bytes_decompressed() >= target.content_offset + target.content_len {
                    let buffer = inflater.current_buffer();
                    let data = buffer
                        [target.content_offset..target.content_offset + target.content_len]
                        .to_vec();
                    return Ok(Some((target.entry.clone(), data)));
                }
            }
        }

        match found {
            Some(target) => error::FoundButIncompleteSnafu {
                path: target.entry.name,
                digest: layer.digest.clone(),
            }
            .fail(),
            None => Ok(None),
        }
    }
}
