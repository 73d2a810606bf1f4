use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response};
use snafu::ResultExt;
use url::Url;

use crate::{error, Result};

/// Registry endpoint serving the distribution v2 API
const REGISTRY_BASE: &str = "https://registry-1.docker.io";
/// Token endpoint for anonymous pull scopes
const AUTH_BASE: &str = "https://auth.docker.io/token";
const AUTH_SERVICE: &str = "registry.docker.io";
/// Both single-platform manifest flavors; index documents come back when the
/// reference points at a multi-arch image regardless
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
                               application/vnd.oci.image.manifest.v1+json";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A trait for a client implementing requests to an oci registry. This is primarily implemented
/// to allow for ease of unittesting this crate.
#[async_trait]
pub(crate) trait RegistryClientImpl: Send + Sync + Debug {
    /// GET {auth}?service=…&scope=repository:{namespace}/{repository}:pull
    async fn get_token(&self, namespace: &str, repository: &str) -> Result<Response>;
    /// GET {registry}/v2/{namespace}/{repository}/manifests/{reference}
    async fn get_manifest(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<Response>;
    /// GET {registry}/v2/{namespace}/{repository}/blobs/{digest} with `Range: bytes={start}-{end}`
    async fn get_blob_range(
        &self,
        namespace: &str,
        repository: &str,
        digest: &str,
        start: u64,
        end: u64,
        token: Option<&str>,
    ) -> Result<Response>;
}

/// Implements a simple registry client using reqwest. One shared connection
/// pool with keep-alive and a per-request timeout; TLS verification is on
/// unless the caller explicitly opts out.
#[derive(Debug)]
pub struct SimpleRegistryClient {
    client: reqwest::Client,
}

impl SimpleRegistryClient {
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .context(error::HttpClientSnafu)?;
        Ok(Self { client })
    }

    fn auth(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
        if let Some(token) = token {
            request.bearer_auth(token)
        } else {
            request
        }
    }
}

#[async_trait]
impl RegistryClientImpl for SimpleRegistryClient {
    async fn get_token(&self, namespace: &str, repository: &str) -> Result<Response> {
        let url = Url::parse(AUTH_BASE).context(error::UrlSnafu)?;
        let scope = format!("repository:{namespace}/{repository}:pull");
        self.client
            .get(url)
            .query(&[("service", AUTH_SERVICE), ("scope", scope.as_str())])
            .send()
            .await
            .context(error::RequestSnafu)
    }

    async fn get_manifest(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<Response> {
        let url = Url::parse(&format!(
            "{REGISTRY_BASE}/v2/{namespace}/{repository}/manifests/{reference}"
        ))
        .context(error::UrlSnafu)?;
        let request = self.client.get(url).header("Accept", MANIFEST_ACCEPT);
        Self::auth(request, token)
            .send()
            .await
            .context(error::RequestSnafu)
    }

    async fn get_blob_range(
        &self,
        namespace: &str,
        repository: &str,
        digest: &str,
        start: u64,
        end: u64,
        token: Option<&str>,
    ) -> Result<Response> {
        let url = Url::parse(&format!(
            "{REGISTRY_BASE}/v2/{namespace}/{repository}/blobs/{digest}"
        ))
        .context(error::UrlSnafu)?;
        let request = self
            .client
            .get(url)
            .header("Range", format!("bytes={start}-{end}"));
        Self::auth(request, token)
            .send()
            .await
            .context(error::RequestSnafu)
    }
}

/// Handle to a registry client. This primarily is utilized as an intercept point for unittesting
#[derive(Clone, Debug)]
pub struct RegistryClient {
    client: Arc<dyn RegistryClientImpl>,
}

impl RegistryClient {
    pub fn new(accept_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            client: Arc::new(SimpleRegistryClient::new(accept_invalid_certs)?),
        })
    }

    pub(crate) fn from_impl(client: Arc<dyn RegistryClientImpl>) -> Self {
        Self { client }
    }

    pub(crate) async fn get_token(&self, namespace: &str, repository: &str) -> Result<Response> {
        self.client.get_token(namespace, repository).await
    }

    pub(crate) async fn get_manifest(
        &self,
        namespace: &str,
        repository: &str,
        reference: &str,
        token: Option<&str>,
    ) -> Result<Response> {
        self.client
            .get_manifest(namespace, repository, reference, token)
            .await
    }

    pub(crate) async fn get_blob_range(
        &self,
        namespace: &str,
        repository: &str,
        digest: &str,
        start: u64,
        end: u64,
        token: Option<&str>,
    ) -> Result<Response> {
        self.client
            .get_blob_range(namespace, repository, digest, start, end, token)
            .await
    }
}
