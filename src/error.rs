use std::num::ParseIntError;

use reqwest::header::ToStrError;
use snafu::Snafu;

use crate::introspect::IntrospectOptionsBuilderError;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("failed to authorize with oci registry: {reason}"))]
    Authorization { reason: String },
    #[snafu(display("operation was cancelled"))]
    Cancelled,
    #[snafu(display("failed to open metadata cache: {source}"))]
    CacheOpen { source: sqlx::Error },
    #[snafu(display("failed to read from metadata cache: {source}"))]
    CacheRead { source: sqlx::Error },
    #[snafu(display("failed to write to metadata cache: {source}"))]
    CacheWrite { source: sqlx::Error },
    #[snafu(display("metadata cache held an invalid entries blob: {source}"))]
    CacheDeserialize { source: serde_json::Error },
    #[snafu(display("registry returned an invalid Content-Range header: {value}"))]
    ContentRange { value: String },
    #[snafu(display("manifest did not contain any layers"))]
    EmptyManifest,
    #[snafu(display(
        "found '{path}' in layer {digest} but the blob ended before its content was complete"
    ))]
    FoundButIncomplete { path: String, digest: String },
    #[snafu(display("failed to fetch manifest for {reference}: registry returned {status}"))]
    FetchManifest { reference: String, status: u16 },
    #[snafu(display("failed to build http client: {source}"))]
    HttpClient { source: reqwest::Error },
    #[snafu(display("oci registry did not return a proper header"))]
    ImproperHeader { source: ToStrError },
    #[snafu(display("gzip stream is corrupt: {reason}"))]
    Inflate { reason: String },
    #[snafu(display("only {len} decompressed bytes available, not enough for a tar header"))]
    InsufficientData { len: usize },
    #[snafu(display("invalid algorithm in digest: {algorithm}"))]
    InvalidAlgorithm { algorithm: String },
    #[snafu(display("malformed image reference: {reason}"))]
    MalformedReference { reason: String },
    #[snafu(display("failed to deserialize manifest: {source}"))]
    ManifestDeserialize { source: serde_json::Error },
    #[snafu(display("no layer of the image contains '{path}'"))]
    NotFound { path: String },
    #[snafu(display("layer blob is not gzip compressed (missing magic bytes)"))]
    NotGzip,
    #[snafu(display("invalid introspect options: {source}"))]
    Options { source: IntrospectOptionsBuilderError },
    #[snafu(display("failed to make request to oci registry: {source}"))]
    Request { source: reqwest::Error },
    #[snafu(display("failed to parse response from oci registry: {source}"))]
    ResponseDeserialize { source: reqwest::Error },
    #[snafu(display("failed to serialize to json: {source}"))]
    Serialize { source: serde_json::Error },
    #[snafu(display("total blob size was not a valid number: {source}"))]
    TotalNotNumber { source: ParseIntError },
    #[snafu(display("invalid url detected: {source}"))]
    Url { source: url::ParseError },
}

impl Error {
    /// True for failures that must abort a whole image operation instead of
    /// being contained at the per-layer boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Authorization { .. }
                | Error::Cancelled
                | Error::FetchManifest { .. }
                | Error::ManifestDeserialize { .. }
                | Error::EmptyManifest
        )
    }
}
