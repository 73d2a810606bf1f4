use reqwest::Response;
use serde::de::DeserializeOwned;
use snafu::{ensure, ResultExt};

use crate::client::RegistryClient;
use crate::models::{IndexEntry, LayerDescriptor, ManifestDocument, Platform};
use crate::{error, Result};

/// The outcome of resolving one image reference down to a single platform's
/// ordered layer list, base layer first.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    /// Digest of the inner manifest when a multi-arch index was traversed
    pub digest: Option<String>,
    /// Platform of the chosen index entry, so callers can see which
    /// architecture they actually got when the preferred one was absent
    pub platform: Option<Platform>,
    pub layers: Vec<LayerDescriptor>,
}

/// Fetches image manifests and flattens multi-arch indexes down to one
/// platform's layer descriptors.
#[derive(Clone, Debug)]
pub struct ManifestResolver {
    client: RegistryClient,
}

impl ManifestResolver {
    pub fn new(client: RegistryClient) -> Self {
        Self { client }
    }

    /// Resolve `reference` to an ordered layer list. When the registry
    /// returns an image index the entry matching `platform` is chosen, or
    /// the first entry if no match exists, and the inner manifest is fetched
    /// by digest. Resolution of the same reference is idempotent.
    pub async fn resolve(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        platform: &Platform,
        token: Option<&str>,
    ) -> Result<ResolvedManifest> {
        let document = self.fetch(namespace, repository, reference, token).await?;

        let mut inner_digest = None;
        let mut chosen_platform = None;
        let document = if is_index(&document) {
            ensure!(!document.manifests.is_empty(), error::EmptyManifestSnafu);
            let entry = select_entry(&document.manifests, platform);
            debug!(
                target: "manifest",
                "index for {namespace}/{repository}:{reference} resolved to {} ({})",
                entry.digest,
                entry
                    .platform
                    .as_ref()
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "unknown platform".to_string()),
            );
            inner_digest = Some(entry.digest.clone());
            chosen_platform = entry.platform.clone();
            self.fetch(namespace, repository, &entry.digest, token)
                .await?
        } else {
            document
        };

        ensure!(!document.layers.is_empty(), error::EmptyManifestSnafu);
        Ok(ResolvedManifest {
            digest: inner_digest,
            platform: chosen_platform,
            layers: document.layers,
        })
    }

    async fn fetch(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<ManifestDocument> {
        let response = self
            .client
            .get_manifest(namespace, repository, reference, token)
            .await?;
        trace!(target: "manifest", "get_manifest: {:?}", response);
        ensure!(
            response.status().is_success(),
            error::FetchManifestSnafu {
                reference: reference.to_string(),
                status: response.status().as_u16(),
            }
        );
        Self::body(response).await
    }

    /// Handles deserialization of responses with proper logging
    async fn body<T>(response: Response) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let value: serde_json::Value = response
            .json()
            .await
            .context(error::ResponseDeserializeSnafu)?;
        trace!(target: "manifest", "RESPONSE BODY: {value}");
        serde_json::from_value(value).context(error::ManifestDeserializeSnafu)
    }
}

/// An index carries `manifests`; a resolvable manifest carries `layers`.
/// The media type decides when present, the document shape otherwise.
fn is_index(document: &ManifestDocument) -> bool {
    match document.media_type.as_ref() {
        Some(media_type) => media_type.is_index(),
        None => !document.manifests.is_empty() && document.layers.is_empty(),
    }
}

/// First entry matching the preferred platform, or else the first entry
fn select_entry<'a>(entries: &'a [IndexEntry], platform: &Platform) -> &'a IndexEntry {
    entries
        .iter()
        .find(|entry| entry.platform.as_ref() == Some(platform))
        .unwrap_or(&entries[0])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::ManifestDocument;

    fn entry(digest: &str, os: &str, architecture: &str) -> IndexEntry {
        serde_json::from_value(serde_json::json!({
            "digest": digest,
            "platform": { "os": os, "architecture": architecture },
        }))
        .unwrap()
    }

    #[test]
    fn test_select_entry_prefers_platform() {
        let entries = vec![
            entry("sha256:arm", "linux", "arm64"),
            entry("sha256:amd", "linux", "amd64"),
        ];
        let chosen = select_entry(&entries, &Platform::default());
        assert_eq!(chosen.digest, "sha256:amd");
    }

    #[test]
    fn test_select_entry_falls_back_to_first() {
        let entries = vec![
            entry("sha256:arm", "linux", "arm64"),
            entry("sha256:s390", "linux", "s390x"),
        ];
        let chosen = select_entry(&entries, &Platform::default());
        assert_eq!(chosen.digest, "sha256:arm");
    }

    #[test]
    fn test_manifest_document_shapes() {
        let manifest: ManifestDocument = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": { "digest": "sha256:cfg", "size": 7, "mediaType": "application/vnd.docker.container.image.v1+json" },
            "layers": [
                { "digest": "sha256:base", "size": 32, "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip" },
                { "digest": "sha256:top", "size": 16, "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip" },
            ],
        }))
        .unwrap();
        assert!(!is_index(&manifest));
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.layers[0].digest, "sha256:base");

        let index: ManifestDocument = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                { "digest": "sha256:inner", "platform": { "os": "linux", "architecture": "amd64" } },
            ],
        }))
        .unwrap();
        assert!(is_index(&index));
        assert_eq!(index.manifests.len(), 1);
    }

    #[test]
    fn test_untyped_index_detected_by_shape() {
        let index: ManifestDocument = serde_json::from_value(serde_json::json!({
            "manifests": [ { "digest": "sha256:inner" } ],
        }))
        .unwrap();
        assert!(is_index(&index));
    }
}
