use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::client::RegistryClient;
use crate::models::TokenResponse;
use crate::{error, Result};

/// Acquires anonymous pull tokens scoped to one `repository:<ns>/<repo>:pull`
/// and memoizes them per repository for the lifetime of the process. Tokens
/// are short-lived and never persisted; a 401 on the blob endpoint is handled
/// by `refresh`, which bypasses the memo once.
#[derive(Clone, Debug)]
pub struct RegistryAuth {
    client: RegistryClient,
    tokens: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl RegistryAuth {
    pub fn new(client: RegistryClient) -> Self {
        Self {
            client,
            tokens: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Token for the repository, fetching on first use. Any HTTP or decode
    /// failure is an authorization failure for the operation.
    pub async fn acquire(&self, namespace: &str, repository: &str) -> Result<String> {
        let key = (namespace.to_string(), repository.to_string());
        let mut tokens = self.tokens.lock().await;
        if let Some(token) = tokens.get(&key) {
            return Ok(token.clone());
        }
        let token = self.fetch(namespace, repository).await?;
        tokens.insert(key, token.clone());
        Ok(token)
    }

    /// Fetch a fresh token, replacing any memoized one. Used for the single
    /// retry after a 401 from the blob endpoint.
    pub async fn refresh(&self, namespace: &str, repository: &str) -> Result<String> {
        debug!(target: "auth", "refreshing pull token for {namespace}/{repository}");
        let token = self.fetch(namespace, repository).await?;
        let key = (namespace.to_string(), repository.to_string());
        self.tokens.lock().await.insert(key, token.clone());
        Ok(token)
    }

    async fn fetch(&self, namespace: &str, repository: &str) -> Result<String> {
        let response = self
            .client
            .get_token(namespace, repository)
            .await
            .map_err(|source| error::Error::Authorization {
                reason: source.to_string(),
            })?;
        trace!(target: "auth", "get_token: {:?}", response);
        snafu::ensure!(
            response.status().is_success(),
            error::AuthorizationSnafu {
                reason: format!("token endpoint returned {}", response.status()),
            }
        );
        let body: TokenResponse =
            response
                .json()
                .await
                .map_err(|source| error::Error::Authorization {
                    reason: format!("failed to decode token response: {source}"),
                })?;
        Ok(body.token)
    }
}
