//! Fetch the raw text of a metrics endpoint
//!
//! Collectors are generic over [`Fetch`] so the extraction paths can be driven
//! without a network. [`Http`] is the real thing: one plain GET per call, no
//! retry and no timeout beyond what the client itself imposes.

use std::future::Future;

use reqwest::Url;
use tracing::trace;

#[derive(thiserror::Error, Debug)]
/// Errors produced by [`Fetch`] implementations
pub enum Error {
    /// The request failed, returned a non-2xx status or its body could not be
    /// read as text.
    #[error("Failed to fetch metrics: {0}")]
    Request(#[from] reqwest::Error),
}

/// A source of raw metrics text.
pub trait Fetch {
    /// Retrieve the body found at `uri`.
    fn fetch(&self, uri: &Url) -> impl Future<Output = Result<String, Error>> + Send;
}

/// [`Fetch`] over plain HTTP GET.
#[derive(Debug, Clone, Default)]
pub struct Http {
    client: reqwest::Client,
}

impl Http {
    /// Create a new [`Http`] transport with a fresh client.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new [`Http`] transport sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Fetch for Http {
    async fn fetch(&self, uri: &Url) -> Result<String, Error> {
        let resp = self
            .client
            .get(uri.clone())
            .send()
            .await?
            .error_for_status()?;
        let text = resp.text().await?;
        trace!("fetched {len} bytes from {uri}", len = text.len());
        Ok(text)
    }
}
