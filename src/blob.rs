use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::StatusCode;
use snafu::{OptionExt, ResultExt};

use crate::auth::RegistryAuth;
use crate::client::RegistryClient;
use crate::{error, Result};

/// Default chunk size for range requests against a layer blob
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

/// Parsed Content-Range header, `bytes <start>-<end>/<total>`
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ContentRange {
    pub start: u64,
    pub total: u64,
}

impl ContentRange {
    pub(crate) fn parse(value: &str) -> Option<Self> {
        let value = value.strip_prefix("bytes ")?;
        let (range, total) = value.split_once('/')?;
        let (start, _end) = range.split_once('-')?;
        Some(ContentRange {
            start: start.parse().ok()?,
            total: total.parse().ok()?,
        })
    }
}

/// Issues successive byte-range requests against one layer blob, advancing an
/// internal cursor by however many bytes each response actually carried. The
/// blob's total size is discovered from the first response; from then on the
/// reader flips to exhausted once the cursor reaches it, the registry answers
/// 416, or the transport fails.
///
/// Single-use: scoped to one layer operation, holds nothing after exhaustion.
pub struct RangeBlobReader {
    client: RegistryClient,
    auth: RegistryAuth,
    namespace: String,
    repository: String,
    digest: String,
    token: String,
    chunk_size: u64,
    cursor: u64,
    total: Option<u64>,
    exhausted: bool,
    refreshed: bool,
}

impl RangeBlobReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: RegistryClient,
        auth: RegistryAuth,
        namespace: &str,
        repository: &str,
        digest: &str,
        token: String,
        chunk_size: u64,
    ) -> Self {
        Self {
            client,
            auth,
            namespace: namespace.to_string(),
            repository: repository.to_string(),
            digest: digest.to_string(),
            token,
            chunk_size: chunk_size.max(1),
            cursor: 0,
            total: None,
            exhausted: false,
            refreshed: false,
        }
    }

    /// Total blob size as reported by the registry, once known
    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Bytes fetched so far across all chunks
    pub fn bytes_downloaded(&self) -> u64 {
        self.cursor
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next chunk. An empty return value means the blob is
    /// exhausted; errors also mark the reader exhausted so that callers can
    /// uniformly move on to their next unit of work.
    pub async fn fetch_chunk(&mut self) -> Result<Bytes> {
        if self.exhausted {
            return Ok(Bytes::new());
        }
        match self.fetch_inner().await {
            Ok(chunk) => Ok(chunk),
            Err(source) => {
                self.exhausted = true;
                Err(source)
            }
        }
    }

    async fn fetch_inner(&mut self) -> Result<Bytes> {
        let end = self.cursor + self.chunk_size - 1;
        let mut response = self
            .client
            .get_blob_range(
                &self.namespace,
                &self.repository,
                &self.digest,
                self.cursor,
                end,
                Some(&self.token),
            )
            .await?;
        trace!(target: "blob", "get_blob_range {}-{end}: {:?}", self.cursor, response);

        // one token refresh per reader, a second 401 is fatal
        if response.status() == StatusCode::UNAUTHORIZED && !self.refreshed {
            self.refreshed = true;
            self.token = self.auth.refresh(&self.namespace, &self.repository).await?;
            response = self
                .client
                .get_blob_range(
                    &self.namespace,
                    &self.repository,
                    &self.digest,
                    self.cursor,
                    end,
                    Some(&self.token),
                )
                .await?;
        }
        if response.status() == StatusCode::UNAUTHORIZED {
            return error::AuthorizationSnafu {
                reason: "blob endpoint returned 401 after a token refresh",
            }
            .fail();
        }
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            self.exhausted = true;
            return Ok(Bytes::new());
        }
        let response = response.error_for_status().context(error::RequestSnafu)?;

        if self.total.is_none() {
            self.total = self.discover_total(&response)?;
            if let Some(total) = self.total {
                debug!(target: "blob", "blob {} totals {total} bytes", self.digest);
            }
        }

        // A 200 means the server ignored the range and is sending the blob
        // from byte zero; skip ahead to the cursor before accumulating.
        let mut skip = if response.status() == StatusCode::OK {
            self.cursor
        } else {
            0
        };
        // The server may answer with more or fewer bytes than asked; take
        // what arrives up to the chunk size and drop the rest of the body.
        let mut stream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(piece) = stream.next().await {
            let mut piece = piece.context(error::RequestSnafu)?;
            if skip > 0 {
                let skipped = (piece.len() as u64).min(skip);
                piece = piece.split_off(skipped as usize);
                skip -= skipped;
            }
            buffer.extend_from_slice(&piece);
            if buffer.len() as u64 >= self.chunk_size {
                break;
            }
        }
        buffer.truncate(self.chunk_size as usize);

        self.cursor += buffer.len() as u64;
        if buffer.is_empty() {
            self.exhausted = true;
        }
        if let Some(total) = self.total {
            if self.cursor >= total {
                self.exhausted = true;
            }
        }
        Ok(buffer.freeze())
    }

    /// Total size out of Content-Range for 206 responses, Content-Length for
    /// servers that ignored the range and answered 200.
    fn discover_total(&self, response: &reqwest::Response) -> Result<Option<u64>> {
        if let Some(header) = response.headers().get("Content-Range") {
            let value = header.to_str().context(error::ImproperHeaderSnafu)?;
            let parsed = ContentRange::parse(value).context(error::ContentRangeSnafu {
                value: value.to_string(),
            })?;
            trace!(target: "blob", "content-range {}-… of {}", parsed.start, parsed.total);
            return Ok(Some(parsed.total));
        }
        if response.status() == StatusCode::OK {
            if let Some(header) = response.headers().get("Content-Length") {
                let value = header.to_str().context(error::ImproperHeaderSnafu)?;
                let total = value.parse().context(error::TotalNotNumberSnafu)?;
                return Ok(Some(total));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::ContentRange;

    #[test]
    fn test_parse_content_range() {
        let range = ContentRange::parse("bytes 0-65535/31457280").unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.total, 31457280);
    }

    #[test]
    fn test_parse_content_range_invalid() {
        assert!(ContentRange::parse("invalid").is_none());
        assert!(ContentRange::parse("bytes 0-65535").is_none());
        assert!(ContentRange::parse("bytes x-y/z").is_none());
    }
}
