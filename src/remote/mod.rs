// ABOUTME: Remote OData endpoint abstraction
// ABOUTME: The engines talk to `RemoteApi`; `ODataClient` is the HTTP implementation

pub mod client;
pub mod models;

pub use client::ODataClient;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::mapper::Row;

/// Operations the engines need from the remote service.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// One page of a collection. `url` already carries `$filter`.
    async fn fetch_page(&self, url: &str, skip: usize, top: usize) -> Result<Vec<Row>>;

    /// Perform the CSRF handshake and return the write token.
    async fn fetch_csrf_token(&self, url: &str) -> Result<String>;

    /// POST one entity (with deep-inserted items, if any). Non-2xx is an error.
    async fn post(&self, url: &str, csrf_token: &str, body: &Value) -> Result<Value>;
}

/// Supplies the bearer credential for each request.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer(&self) -> Result<Option<String>>;
}

/// A fixed token from configuration or the environment.
pub struct StaticToken {
    token: Option<String>,
}

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn bearer(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }
}

/// Read every page of a collection until a short or empty page.
pub async fn fetch_all(api: &dyn RemoteApi, url: &str, page_size: usize) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    let mut skip = 0;
    loop {
        let page = api.fetch_page(url, skip, page_size).await?;
        let count = page.len();
        rows.extend(page);
        debug!(skip, count, "Fetched page");

        if count > page_size {
            warn!(
                count,
                page_size, "Remote ignored $top; treating the response as the full collection"
            );
            break;
        }
        if count < page_size {
            break;
        }
        skip += count;
    }
    Ok(rows)
}
