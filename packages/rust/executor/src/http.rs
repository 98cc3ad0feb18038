//! HTTP client for the remote crawl service.
//!
//! Each unit becomes one `POST {base_url}/crawl` with a JSON body
//! `{"keyword": ..., "blog_ids": [...]}`; the response body is a JSON array
//! of result records.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, instrument};
use url::Url;

use crawlbatch_shared::{CrawlBatchError, ExecutorConfig, ResultRecord, Result, WorkUnit};

use crate::RemoteExecutor;

/// User-Agent string for executor requests.
const USER_AGENT: &str = concat!("crawlbatch/", env!("CARGO_PKG_VERSION"));

/// Path appended to the configured base URL.
pub const CRAWL_PATH: &str = "crawl";

/// Request body sent for one unit.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlRequest<'a> {
    pub keyword: &'a str,
    pub blog_ids: &'a [String],
}

/// JSON-over-HTTP [`RemoteExecutor`].
pub struct HttpExecutor {
    client: Client,
    endpoint: Url,
}

impl HttpExecutor {
    /// Build a client for the configured service.
    pub fn new(config: &ExecutorConfig) -> Result<Self> {
        let base = config.base_url()?;
        let endpoint = crawl_endpoint(&base)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| CrawlBatchError::Remote(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, endpoint })
    }

    /// The resolved `/crawl` endpoint.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    #[instrument(skip_all, fields(group = %unit.group_key, members = unit.member_ids.len()))]
    async fn execute(&self, unit: &WorkUnit) -> Result<Vec<ResultRecord>> {
        let body = CrawlRequest {
            keyword: &unit.group_key,
            blog_ids: &unit.member_ids,
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CrawlBatchError::Remote(format!("{}: request timed out", unit.group_key))
                } else {
                    CrawlBatchError::Remote(format!("{}: {e}", unit.group_key))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CrawlBatchError::Remote(format!(
                "{}: HTTP {status}",
                unit.group_key
            )));
        }

        let records: Vec<ResultRecord> = response.json().await.map_err(|e| {
            CrawlBatchError::Remote(format!("{}: invalid response body: {e}", unit.group_key))
        })?;

        debug!(records = records.len(), "executor returned records");
        Ok(records)
    }
}

/// Join the crawl path onto a base URL, keeping any base path prefix.
fn crawl_endpoint(base: &Url) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(CRAWL_PATH)
        .map_err(|e| CrawlBatchError::config(format!("invalid executor endpoint: {e}")))
}
