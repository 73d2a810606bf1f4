use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Handles the media type enumerations relevant to image introspection.
/// The OCI specification allows custom types, so any unrecognized string is
/// preserved as an `Other` variant instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    ImageIndex,
    Manifest,
    Config,
    Layer(Compression),
    DockerManifestList,
    DockerManifest,
    DockerContainerImage,
    DockerImageRootfs(Compression),
    Other(String),
}

impl MediaType {
    pub fn compression(&self) -> Compression {
        match self {
            Self::DockerImageRootfs(compression) => {
                // Docker rootfs diffs are gzip even when the suffix is bare
                if *compression == Compression::None {
                    Compression::Gzip
                } else {
                    compression.clone()
                }
            }
            Self::Layer(compression) => compression.clone(),
            _ => Compression::None,
        }
    }

    /// Whether this media type describes the gzip-compressed tar framing the
    /// peek and carve engines know how to walk.
    pub fn is_gzip_tar(&self) -> bool {
        matches!(
            self,
            Self::Layer(Compression::Gzip) | Self::DockerImageRootfs(_)
        ) && self.compression() == Compression::Gzip
    }

    /// Whether this media type names a multi-platform index document.
    pub fn is_index(&self) -> bool {
        matches!(self, Self::ImageIndex | Self::DockerManifestList)
    }
}

impl Serialize for MediaType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let string = match self {
            Self::ImageIndex => "application/vnd.oci.image.index.v1+json".into(),
            Self::Manifest => "application/vnd.oci.image.manifest.v1+json".into(),
            Self::Config => "application/vnd.oci.image.config.v1+json".into(),
            Self::Layer(compression) => format!(
                "application/vnd.oci.image.layer.v1.tar{}",
                compression.to_ext()
            ),
            Self::DockerManifestList => {
                "application/vnd.docker.distribution.manifest.list.v2+json".into()
            }
            Self::DockerManifest => "application/vnd.docker.distribution.manifest.v2+json".into(),
            Self::DockerContainerImage => "application/vnd.docker.container.image.v1+json".into(),
            Self::DockerImageRootfs(compression) => format!(
                "application/vnd.docker.image.rootfs.diff.tar{}",
                compression.to_ext()
            ),
            Self::Other(value) => value.clone(),
        };
        serializer.serialize_str(string.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        if string.starts_with("application/vnd.docker.image.rootfs.diff.tar") {
            let compression = Compression::new(string.as_str());
            Ok(MediaType::DockerImageRootfs(compression))
        } else if string.starts_with("application/vnd.oci.image.layer.v1.tar") {
            let compression = Compression::new(string.as_str());
            Ok(MediaType::Layer(compression))
        } else {
            match string.as_ref() {
                "application/vnd.docker.distribution.manifest.list.v2+json" => {
                    Ok(MediaType::DockerManifestList)
                }
                "application/vnd.docker.distribution.manifest.v2+json" => {
                    Ok(MediaType::DockerManifest)
                }
                "application/vnd.docker.container.image.v1+json" => {
                    Ok(MediaType::DockerContainerImage)
                }
                "application/vnd.oci.image.manifest.v1+json" => Ok(MediaType::Manifest),
                "application/vnd.oci.image.index.v1+json" => Ok(MediaType::ImageIndex),
                "application/vnd.oci.image.config.v1+json" => Ok(MediaType::Config),
                _ => Ok(MediaType::Other(string)),
            }
        }
    }
}

/// Helper enum to specify the compression algorithm used
/// with a layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Bzip2,
    Lz4,
    Xz,
    Zstd,
    None,
}

impl Compression {
    pub fn new(string: &str) -> Self {
        // OCI uses a `+gzip` suffix, docker rootfs types use `.gzip`
        if string.ends_with("gzip") || string.ends_with(".gz") {
            Compression::Gzip
        } else if string.ends_with("xz") {
            Compression::Xz
        } else if string.ends_with("lz4") {
            Compression::Lz4
        } else if string.ends_with("zstd") || string.ends_with(".zst") {
            Compression::Zstd
        } else if string.ends_with("bzip2") || string.ends_with(".bz2") {
            Compression::Bzip2
        } else {
            Compression::None
        }
    }

    pub fn to_ext(&self) -> &str {
        match self {
            Self::Gzip => ".gz",
            Self::Bzip2 => ".bz2",
            Self::Lz4 => ".lz4",
            Self::Xz => ".xz",
            Self::Zstd => ".zst",
            Self::None => "",
        }
    }
}

/// Represents the frequently used platform identifiers both in json format and as the
/// commandline <os>/<architecture> format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
}

impl Default for Platform {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}/{}", self.os, self.architecture))
    }
}

/// Identifies one layer blob of one resolved image manifest. Within a
/// manifest, descriptors form an ordered sequence, base layer first; the
/// digest is the immutable content-addressable key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LayerDescriptor {
    pub media_type: MediaType,
    pub size: u64,
    pub digest: String,
}

impl LayerDescriptor {
    /// Short digest form for log lines and progress labels
    pub fn short_digest(&self) -> &str {
        let hex = self
            .digest
            .split_once(':')
            .map(|(_, hex)| hex)
            .unwrap_or(self.digest.as_str());
        &hex[..hex.len().min(12)]
    }
}

/// Response body of the anonymous pull-token endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
}

/// One entry of a multi-platform image index.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IndexEntry {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// View model for a manifest response, which is either a single-platform
/// manifest carrying `layers` or an image index carrying `manifests`.
/// Unknown fields are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManifestDocument {
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
    #[serde(default)]
    pub manifests: Vec<IndexEntry>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_media_type_round_trip() {
        let json = "\"application/vnd.docker.image.rootfs.diff.tar.gz\"";
        let media: MediaType = serde_json::from_str(json).unwrap();
        assert_eq!(media, MediaType::DockerImageRootfs(Compression::Gzip));
        assert_eq!(serde_json::to_string(&media).unwrap(), json);

        // the long-form docker suffix decodes to the same variant
        let media: MediaType =
            serde_json::from_str("\"application/vnd.docker.image.rootfs.diff.tar.gzip\"").unwrap();
        assert_eq!(media, MediaType::DockerImageRootfs(Compression::Gzip));
    }

    #[test]
    fn test_media_type_gzip_suffixes() {
        let media: MediaType =
            serde_json::from_str("\"application/vnd.oci.image.layer.v1.tar+gzip\"").unwrap();
        assert_eq!(media, MediaType::Layer(Compression::Gzip));
        assert!(media.is_gzip_tar());

        let media: MediaType =
            serde_json::from_str("\"application/vnd.oci.image.layer.v1.tar+zstd\"").unwrap();
        assert_eq!(media, MediaType::Layer(Compression::Zstd));
        assert!(!media.is_gzip_tar());
    }

    #[test]
    fn test_bare_rootfs_defaults_to_gzip() {
        let media: MediaType =
            serde_json::from_str("\"application/vnd.docker.image.rootfs.diff.tar\"").unwrap();
        assert_eq!(media, MediaType::DockerImageRootfs(Compression::None));
        assert_eq!(media.compression(), Compression::Gzip);
        assert!(media.is_gzip_tar());
    }

    #[test]
    fn test_unknown_media_type_is_preserved() {
        let json = "\"application/vnd.example.custom+json\"";
        let media: MediaType = serde_json::from_str(json).unwrap();
        assert_eq!(
            media,
            MediaType::Other("application/vnd.example.custom+json".to_string())
        );
        assert_eq!(serde_json::to_string(&media).unwrap(), json);
        assert!(!media.is_gzip_tar());
    }

    #[test]
    fn test_index_media_types() {
        assert!(MediaType::ImageIndex.is_index());
        assert!(MediaType::DockerManifestList.is_index());
        assert!(!MediaType::Manifest.is_index());
    }

    #[test]
    fn test_short_digest() {
        let layer = LayerDescriptor {
            media_type: MediaType::DockerImageRootfs(Compression::Gzip),
            size: 1234,
            digest: "sha256:0123456789abcdef0123456789abcdef".to_string(),
        };
        assert_eq!(layer.short_digest(), "0123456789ab");
    }
}
