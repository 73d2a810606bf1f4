use std::sync::Arc;

use derive_builder::Builder;
use snafu::ensure;
use tokio_util::sync::CancellationToken;

use crate::auth::RegistryAuth;
use crate::blob::DEFAULT_CHUNK_SIZE;
use crate::cache::MetadataCache;
use crate::carve::{CarveResult, LayerCarveEngine};
use crate::client::RegistryClient;
use crate::manifest::{ManifestResolver, ResolvedManifest};
use crate::models::{LayerDescriptor, Platform};
use crate::peek::{LayerPeekEngine, LayerPeekResult};
use crate::tar::TarEntry;
use crate::{error, Result};

/// Serial progress callback: `(stage, current, total)`. Implementations must
/// make no assumptions about the invoking thread.
pub type ProgressFn = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

/// Tuning knobs for the introspection engines
#[derive(Builder, Debug, Clone)]
#[builder(setter(into), default)]
pub struct IntrospectOptions {
    /// Compressed prefix fetched when peeking one layer
    pub peek_prefix_bytes: u64,
    /// Compressed prefix fetched per layer during an image-wide peek
    pub image_peek_prefix_bytes: u64,
    /// Chunk size for carve range requests
    pub carve_chunk_bytes: u64,
    /// Preferred platform when resolving a multi-arch index
    pub platform: Platform,
}

impl Default for IntrospectOptions {
    fn default() -> Self {
        Self {
            peek_prefix_bytes: DEFAULT_CHUNK_SIZE,
            image_peek_prefix_bytes: 4 * DEFAULT_CHUNK_SIZE,
            carve_chunk_bytes: DEFAULT_CHUNK_SIZE,
            platform: Platform::default(),
        }
    }
}

/// One entry of an image-wide listing, tagged with the index of the layer it
/// came from so callers can run overlay merging on top.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub layer: usize,
    pub entry: TarEntry,
}

/// Aggregate result of peeking every layer of one image
#[derive(Debug, Clone)]
pub struct ImageIndex {
    pub layers: Vec<LayerDescriptor>,
    /// Platform chosen during index resolution, when the reference was
    /// multi-arch
    pub platform: Option<Platform>,
    pub layers_peeked: usize,
    pub layers_from_cache: usize,
    /// Bytes fetched from the network; cache hits contribute nothing
    pub total_bytes_downloaded: u64,
    pub total_entries: usize,
    /// Concatenation of per-layer entries in base-first layer order
    pub all_entries: Vec<IndexedEntry>,
    /// Per-layer results in layer order, failed layers carry an error string
    pub results: Vec<LayerPeekResult>,
}

/// Public surface of the crate: given `(namespace, repository, reference)`,
/// peek every layer of an image or carve one file out of it, merging the
/// metadata cache, token auth, and the per-layer engines.
pub struct ImageIntrospector {
    client: RegistryClient,
    auth: RegistryAuth,
    resolver: ManifestResolver,
    cache: Option<MetadataCache>,
    options: IntrospectOptions,
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
}

impl ImageIntrospector {
    pub fn new(
        client: RegistryClient,
        cache: Option<MetadataCache>,
        options: IntrospectOptions,
    ) -> Self {
        let auth = RegistryAuth::new(client.clone());
        let resolver = ManifestResolver::new(client.clone());
        Self {
            client,
            auth,
            resolver,
            cache,
            options,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Install a progress callback, invoked serially during operations
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Handle for cooperative cancellation; observed between chunk fetches
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn report(&self, stage: &str, current: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress(stage, current, total);
        }
    }

    /// Resolve a reference down to its ordered layer descriptors without
    /// touching any blob.
    pub async fn resolve(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
    ) -> Result<ResolvedManifest> {
        let token = self.auth.acquire(namespace, repository).await?;
        self.resolver
            .resolve(
                namespace,
                repository,
                reference,
                &self.options.platform,
                Some(&token),
            )
            .await
    }

    /// Peek one layer, consulting the cache before the network and storing
    /// the result on a miss.
    pub async fn peek_layer(
        &self,
        namespace: &str,
        repository: &str,
        layer: &LayerDescriptor,
    ) -> Result<LayerPeekResult> {
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&layer.digest).await? {
                return Ok(hit);
            }
        }
        let engine = LayerPeekEngine {
            client: &self.client,
            auth: &self.auth,
            cancel: &self.cancel,
        };
        let result = engine
            .peek(namespace, repository, layer, self.options.peek_prefix_bytes)
            .await?;
        if result.error.is_none() {
            if let Some(cache) = &self.cache {
                cache
                    .put(&layer.digest, namespace, repository, &result)
                    .await?;
            }
        }
        Ok(result)
    }

    /// Peek every layer of the image: cache hits are reused as-is, misses
    /// fetch one bounded prefix each. Per-layer failures are recorded in the
    /// returned index without aborting the other layers; authorization and
    /// manifest failures abort the whole operation.
    pub async fn peek_image(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
    ) -> Result<ImageIndex> {
        self.report("auth", 0, 1);
        let token = self.auth.acquire(namespace, repository).await?;
        self.report("auth", 1, 1);

        self.report("manifest", 0, 1);
        let resolved = self
            .resolver
            .resolve(
                namespace,
                repository,
                reference,
                &self.options.platform,
                Some(&token),
            )
            .await?;
        self.report("manifest", 1, 1);

        if let Some(cache) = &self.cache {
            let digests: Vec<String> = resolved
                .layers
                .iter()
                .map(|layer| layer.digest.clone())
                .collect();
            if cache.all_present(&digests).await? {
                debug!(
                    target: "peek",
                    "all {} layers of {namespace}/{repository}:{reference} are cached",
                    digests.len(),
                );
            }
        }

        let total = resolved.layers.len();
        let mut results = Vec::with_capacity(total);
        let mut layers_from_cache = 0;
        let mut total_bytes_downloaded = 0;
        for (index, layer) in resolved.layers.iter().enumerate() {
            ensure!(!self.cancel.is_cancelled(), error::CancelledSnafu);
            self.report("peek", index + 1, total);

            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.get(&layer.digest).await? {
                    layers_from_cache += 1;
                    results.push(hit);
                    continue;
                }
            }

            let engine = LayerPeekEngine {
                client: &self.client,
                auth: &self.auth,
                cancel: &self.cancel,
            };
            match engine
                .peek(namespace, repository, layer, self.options.image_peek_prefix_bytes)
                .await
            {
                Ok(result) => {
                    total_bytes_downloaded += result.bytes_downloaded;
                    if result.error.is_none() {
                        if let Some(cache) = &self.cache {
                            cache
                                .put(&layer.digest, namespace, repository, &result)
                                .await?;
                        }
                    }
                    results.push(result);
                }
                Err(source) if source.is_fatal() => return Err(source),
                Err(source) => {
                    warn!(
                        target: "peek",
                        "layer {} failed: {source}",
                        layer.short_digest(),
                    );
                    results.push(LayerPeekResult {
                        digest: layer.digest.clone(),
                        partial: true,
                        bytes_downloaded: 0,
                        bytes_decompressed: 0,
                        entries_found: 0,
                        entries: Vec::new(),
                        error: Some(source.to_string()),
                    });
                }
            }
        }

        let all_entries: Vec<IndexedEntry> = results
            .iter()
            .enumerate()
            .flat_map(|(layer, result)| {
                result.entries.iter().map(move |entry| IndexedEntry {
                    layer,
                    entry: entry.clone(),
                })
            })
            .collect();
        Ok(ImageIndex {
            layers: resolved.layers,
            platform: resolved.platform,
            layers_peeked: results.len(),
            layers_from_cache,
            total_bytes_downloaded,
            total_entries: all_entries.len(),
            all_entries,
            results,
        })
    }

    /// Extract one file by path, searching layers in base-first order and
    /// downloading no further than the byte that completes its content.
    pub async fn carve_file(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        path: &str,
    ) -> Result<CarveResult> {
        self.report("auth", 0, 1);
        let token = self.auth.acquire(namespace, repository).await?;
        self.report("auth", 1, 1);

        self.report("manifest", 0, 1);
        let resolved = self
            .resolver
            .resolve(
                namespace,
                repository,
                reference,
                &self.options.platform,
                Some(&token),
            )
            .await?;
        self.report("manifest", 1, 1);

        let engine = LayerCarveEngine {
            client: &self.client,
            auth: &self.auth,
            cancel: &self.cancel,
        };
        engine
            .carve(
                namespace,
                repository,
                &resolved.layers,
                path,
                self.options.carve_chunk_bytes,
                self.progress.as_ref(),
            )
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::RegistryClientImpl;
    use crate::error::Error;
    use crate::tar::BLOCK_SIZE;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const LAYER_MEDIA: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// In-memory registry backing the client seam
    #[derive(Debug, Default)]
    struct FakeRegistry {
        manifests: HashMap<String, serde_json::Value>,
        blobs: HashMap<String, Vec<u8>>,
        token_fetches: AtomicUsize,
        manifest_fetches: AtomicUsize,
        blob_fetches: AtomicUsize,
        blob_log: Mutex<Vec<String>>,
        /// When set, blob requests carrying the first issued token get a 401
        reject_first_token: bool,
    }

    impl FakeRegistry {
        fn current_token(&self) -> String {
            format!("token-{}", self.token_fetches.load(Ordering::SeqCst))
        }

        fn network_requests(&self) -> usize {
            self.token_fetches.load(Ordering::SeqCst)
                + self.manifest_fetches.load(Ordering::SeqCst)
                + self.blob_fetches.load(Ordering::SeqCst)
        }
    }

    fn response(status: u16, headers: &[(&str, String)], body: Vec<u8>) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, value);
        }
        reqwest::Response::from(builder.body(body).unwrap())
    }

    #[async_trait]
    impl RegistryClientImpl for FakeRegistry {
        async fn get_token(&self, _namespace: &str, _repository: &str) -> crate::Result<reqwest::Response> {
            self.token_fetches.fetch_add(1, Ordering::SeqCst);
            let body = format!("{{\"token\":\"{}\"}}", self.current_token());
            Ok(response(200, &[], body.into_bytes()))
        }

        async fn get_manifest(
            &self,
            _namespace: &str,
            _repository: &str,
            reference: &str,
            _token: Option<&str>,
        ) -> crate::Result<reqwest::Response> {
            self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
            match self.manifests.get(reference) {
                Some(document) => Ok(response(200, &[], document.to_string().into_bytes())),
                None => Ok(response(404, &[], b"{\"errors\":[]}".to_vec())),
            }
        }

        async fn get_blob_range(
            &self,
            _namespace: &str,
            _repository: &str,
            digest: &str,
            start: u64,
            end: u64,
            token: Option<&str>,
        ) -> crate::Result<reqwest::Response> {
            self.blob_fetches.fetch_add(1, Ordering::SeqCst);
            self.blob_log.lock().unwrap().push(digest.to_string());
            if self.reject_first_token && token == Some("token-1") {
                return Ok(response(401, &[], Vec::new()));
            }
            let Some(blob) = self.blobs.get(digest) else {
                return Ok(response(404, &[], Vec::new()));
            };
            let total = blob.len() as u64;
            if start >= total {
                return Ok(response(416, &[], Vec::new()));
            }
            let end = end.min(total - 1);
            let body = blob[start as usize..=end as usize].to_vec();
            let content_range = ("Content-Range", format!("bytes {start}-{end}/{total}"));
            Ok(response(206, &[content_range], body))
        }
    }

    fn tar_header(name: &str, size: u64, typeflag: u8) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..name.len()].copy_from_slice(name.as_bytes());
        block[100..108].copy_from_slice(b"0000644\0");
        block[108..116].copy_from_slice(b"0000000\0");
        block[116..124].copy_from_slice(b"0000000\0");
        let octal = format!("{size:011o}\0");
        block[124..136].copy_from_slice(octal.as_bytes());
        block[136..148].copy_from_slice(b"14371573620\0");
        block[156] = typeflag;
        block[257..262].copy_from_slice(b"ustar");
        block
    }

    fn tar_archive(files: &[(&str, &[u8], u8)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content, typeflag) in files {
            out.extend_from_slice(&tar_header(name, content.len() as u64, *typeflag));
            out.extend_from_slice(content);
            let padding = content.len().next_multiple_of(BLOCK_SIZE) - content.len();
            out.extend(std::iter::repeat_n(0u8, padding));
        }
        out.extend(std::iter::repeat_n(0u8, BLOCK_SIZE * 2));
        out
    }

    fn gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    fn layer_blob(files: &[(&str, &[u8], u8)]) -> Vec<u8> {
        gzip(&tar_archive(files))
    }

    fn manifest_json(layers: &[(&str, usize)]) -> serde_json::Value {
        serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "layers": layers
                .iter()
                .map(|(digest, size)| {
                    serde_json::json!({ "digest": digest, "size": size, "mediaType": LAYER_MEDIA })
                })
                .collect::<Vec<_>>(),
        })
    }

    /// Two-layer image: a base filesystem plus an overlay with one config file
    fn two_layer_registry() -> FakeRegistry {
        let base = layer_blob(&[
            ("etc/", b"", b'5'),
            ("etc/hostname", b"buildhost\n", b'0'),
            ("etc/os-release", b"NAME=\"Alpine Linux\"\n", b'0'),
        ]);
        let top = layer_blob(&[
            ("srv/", b"", b'5'),
            ("srv/app.conf", b"listen 8080\n", b'0'),
        ]);
        let mut registry = FakeRegistry::default();
        registry.manifests.insert(
            "latest".to_string(),
            manifest_json(&[("sha256:base", base.len()), ("sha256:top", top.len())]),
        );
        registry.blobs.insert("sha256:base".to_string(), base);
        registry.blobs.insert("sha256:top".to_string(), top);
        registry
    }

    async fn introspector(registry: Arc<FakeRegistry>) -> ImageIntrospector {
        let cache = MetadataCache::in_memory().await.unwrap();
        ImageIntrospector::new(
            RegistryClient::from_impl(registry),
            Some(cache),
            IntrospectOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_peek_image_collects_all_layers() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        let index = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();

        assert_eq!(index.layers_peeked, 2);
        assert_eq!(index.layers_from_cache, 0);
        assert_eq!(index.total_entries, 5);
        assert!(index.total_bytes_downloaded > 0);
        assert_eq!(index.all_entries[0].entry.name, "etc/");
        assert_eq!(index.all_entries[0].layer, 0);
        assert_eq!(index.all_entries[3].entry.name, "srv/");
        assert_eq!(index.all_entries[3].layer, 1);
        assert!(index.results.iter().all(|r| r.partial && r.error.is_none()));
    }

    #[tokio::test]
    async fn test_peek_image_second_run_is_all_cache() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        let first = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        let blob_fetches = registry.blob_fetches.load(Ordering::SeqCst);
        assert!(blob_fetches > 0);

        let second = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        assert_eq!(second.layers_from_cache, second.layers_peeked);
        assert_eq!(second.total_bytes_downloaded, 0);
        // auth and manifest are the only permissible requests on a warm cache
        assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), blob_fetches);
        // cached entries are value-identical to the originating peek
        assert_eq!(second.results[0].entries, first.results[0].entries);
        assert_eq!(second.results[1].entries, first.results[1].entries);
    }

    #[tokio::test]
    async fn test_multi_arch_index_resolution() {
        let mut registry = two_layer_registry();
        let inner = registry.manifests.remove("latest").unwrap();
        registry.manifests.insert(
            "sha256:amd64manifest".to_string(),
            inner,
        );
        registry.manifests.insert(
            "latest".to_string(),
            serde_json::json!({
                "schemaVersion": 2,
                "mediaType": "application/vnd.oci.image.index.v1+json",
                "manifests": [
                    { "digest": "sha256:armmanifest", "platform": { "os": "linux", "architecture": "arm64" } },
                    { "digest": "sha256:amd64manifest", "platform": { "os": "linux", "architecture": "amd64" } },
                ],
            }),
        );
        let registry = Arc::new(registry);
        let introspector = introspector(registry.clone()).await;

        let resolved = introspector.resolve("library", "alpine", "latest").await.unwrap();
        assert_eq!(resolved.digest.as_deref(), Some("sha256:amd64manifest"));
        assert_eq!(resolved.platform, Some(Platform::default()));
        assert_eq!(resolved.layers.len(), 2);
        assert!(resolved.layers[0].digest.starts_with("sha256:"));

        // resolving the same reference again lands on the same inner digest
        let again = introspector.resolve("library", "alpine", "latest").await.unwrap();
        assert_eq!(again.digest, resolved.digest);
    }

    #[tokio::test]
    async fn test_empty_manifest() {
        let mut registry = FakeRegistry::default();
        registry
            .manifests
            .insert("latest".to_string(), manifest_json(&[]));
        let introspector = introspector(Arc::new(registry)).await;
        let result = introspector.peek_image("library", "scratch", "latest").await;
        assert!(matches!(result, Err(Error::EmptyManifest)));
    }

    #[tokio::test]
    async fn test_carve_file_from_base_layer_stops_early() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        let carved = introspector
            .carve_file("library", "alpine", "latest", "/etc/os-release")
            .await
            .unwrap();

        assert_eq!(carved.data, b"NAME=\"Alpine Linux\"\n");
        assert_eq!(carved.entry.size as usize, carved.data.len());
        assert_eq!(carved.layer_digest, "sha256:base");
        assert!(carved.bytes_downloaded <= registry.blobs["sha256:base"].len() as u64);
        // the search never touched the second layer
        assert!(!registry.blob_log.lock().unwrap().contains(&"sha256:top".to_string()));
    }

    #[tokio::test]
    async fn test_carve_missing_path_reads_every_layer() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        let result = introspector
            .carve_file("library", "alpine", "latest", "/definitely/does/not/exist")
            .await;
        assert!(matches!(result, Err(Error::NotFound { .. })));
        let log = registry.blob_log.lock().unwrap();
        assert!(log.contains(&"sha256:base".to_string()));
        assert!(log.contains(&"sha256:top".to_string()));
    }

    #[tokio::test]
    async fn test_carve_found_but_incomplete() {
        // barely compressible content so a truncated blob cannot decompress
        // far enough to cover the matched entry
        let mut state = 0x9e3779b9u64;
        let content = (0..256 * 1024)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect::<Vec<_>>();
        let blob = layer_blob(&[("data/blob.bin", content.as_slice(), b'0')]);
        let truncated = blob[..blob.len() / 2].to_vec();

        let mut registry = FakeRegistry::default();
        registry.manifests.insert(
            "latest".to_string(),
            manifest_json(&[("sha256:cut", truncated.len())]),
        );
        registry.blobs.insert("sha256:cut".to_string(), truncated);
        let introspector = introspector(Arc::new(registry)).await;
        let result = introspector
            .carve_file("library", "broken", "latest", "data/blob.bin")
            .await;
        assert!(matches!(result, Err(Error::FoundButIncomplete { .. })));
    }

    #[tokio::test]
    async fn test_peek_image_contains_corrupt_layer() {
        let mut registry = two_layer_registry();
        registry
            .blobs
            .insert("sha256:top".to_string(), b"this is not a gzip stream".to_vec());
        let introspector = introspector(Arc::new(registry)).await;
        let index = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();

        assert_eq!(index.layers_peeked, 2);
        assert!(index.results[0].error.is_none());
        assert_eq!(index.results[0].entries_found, 3);
        let failure = index.results[1].error.as_deref().unwrap();
        assert!(failure.contains("not gzip"), "unexpected error: {failure}");
    }

    #[tokio::test]
    async fn test_peek_insufficient_data_is_not_cached() {
        // decompresses to fewer than 512 bytes
        let blob = gzip(b"tiny");
        let mut registry = FakeRegistry::default();
        registry.manifests.insert(
            "latest".to_string(),
            manifest_json(&[("sha256:tiny", blob.len())]),
        );
        registry.blobs.insert("sha256:tiny".to_string(), blob);
        let cache = MetadataCache::in_memory().await.unwrap();
        let introspector = ImageIntrospector::new(
            RegistryClient::from_impl(Arc::new(registry)),
            Some(cache.clone()),
            IntrospectOptions::default(),
        );

        let index = introspector
            .peek_image("library", "micro", "latest")
            .await
            .unwrap();
        assert_eq!(index.total_entries, 0);
        assert!(index.results[0].error.is_some());
        assert!(!cache.has("sha256:tiny").await.unwrap());
    }

    #[tokio::test]
    async fn test_carve_skips_non_gzip_layer() {
        let mut registry = two_layer_registry();
        registry
            .blobs
            .insert("sha256:base".to_string(), b"definitely not gzip".to_vec());
        let introspector = introspector(Arc::new(registry)).await;
        let carved = introspector
            .carve_file("library", "alpine", "latest", "srv/app.conf")
            .await
            .unwrap();
        assert_eq!(carved.data, b"listen 8080\n");
        assert_eq!(carved.layer_digest, "sha256:top");
    }

    #[tokio::test]
    async fn test_blob_401_recovers_with_one_refresh() {
        let mut registry = two_layer_registry();
        registry.reject_first_token = true;
        let registry = Arc::new(registry);
        let introspector = introspector(registry.clone()).await;
        let index = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        assert!(index.results.iter().all(|r| r.error.is_none()));
        // the initial token plus exactly one refresh
        assert_eq!(registry.token_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peek_downloads_at_most_the_prefix() {
        let registry = Arc::new(two_layer_registry());
        let options = IntrospectOptionsBuilder::default()
            .image_peek_prefix_bytes(1024u64)
            .build()
            .unwrap();
        let introspector = ImageIntrospector::new(
            RegistryClient::from_impl(registry.clone()),
            None,
            options,
        );
        let index = introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        for result in &index.results {
            assert!(result.bytes_downloaded <= 1024);
        }
    }

    #[tokio::test]
    async fn test_peek_layer_goes_through_cache() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        let resolved = introspector.resolve("library", "alpine", "latest").await.unwrap();
        let layer = &resolved.layers[0];

        let first = introspector
            .peek_layer("library", "alpine", layer)
            .await
            .unwrap();
        assert_eq!(first.entries_found, 3);
        let fetches = registry.blob_fetches.load(Ordering::SeqCst);

        let second = introspector
            .peek_layer("library", "alpine", layer)
            .await
            .unwrap();
        assert_eq!(second, first);
        assert_eq!(registry.blob_fetches.load(Ordering::SeqCst), fetches);
    }

    #[tokio::test]
    async fn test_cancellation_before_work() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        introspector.cancellation_token().cancel();
        let result = introspector.peek_image("library", "alpine", "latest").await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_progress_reports_each_layer() {
        let registry = Arc::new(two_layer_registry());
        let stages: Arc<Mutex<Vec<(String, usize, usize)>>> = Arc::default();
        let seen = stages.clone();
        let introspector = introspector(registry).await.with_progress(Arc::new(
            move |stage: &str, current: usize, total: usize| {
                seen.lock().unwrap().push((stage.to_string(), current, total));
            },
        ));
        introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        let stages = stages.lock().unwrap();
        assert!(stages.contains(&("peek".to_string(), 1, 2)));
        assert!(stages.contains(&("peek".to_string(), 2, 2)));
    }

    #[tokio::test]
    async fn test_network_is_spent_only_once_for_warm_cache() {
        let registry = Arc::new(two_layer_registry());
        let introspector = introspector(registry.clone()).await;
        introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        let after_first = registry.network_requests();
        introspector
            .peek_image("library", "alpine", "latest")
            .await
            .unwrap();
        // token is memoized, so the warm run costs exactly one manifest fetch
        assert_eq!(registry.network_requests(), after_first + 1);
    }
}
