//! JSON-over-HTTP clients.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{
    ClientError, CoordinatorInfo, Ledger, PoolSource, RecordPage, StakeSource, WeightSubmission,
};

fn build_client(timeout: Duration) -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ClientError::Build(e.to_string()))
}

fn transport(url: &str, e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        debug!(url = %url, "Request timed out");
    }
    ClientError::Transport {
        url: url.to_string(),
        message: e.to_string(),
    }
}

/// Fail on a non-success status, otherwise decode the JSON body.
async fn read_json<T: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let response = check_status(url, response).await?;
    response.json().await.map_err(|e| ClientError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

async fn check_status(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    error!(url = %url, status = %status, body = %body, "Request failed");
    Err(ClientError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

// =============================================================================
// Stake query
// =============================================================================

/// Reads `GET {network}/v1/stakes`.
pub struct HttpStakeSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStakeSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl StakeSource for HttpStakeSource {
    async fn fetch_stakes(&self) -> Result<Vec<CoordinatorInfo>, ClientError> {
        let url = format!("{}/v1/stakes", self.base_url);
        debug!(url = %url, "Fetching coordinator stakes");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let stakes: Vec<CoordinatorInfo> = read_json(&url, response).await?;

        debug!(count = stakes.len(), "Fetched coordinator stakes");
        Ok(stakes)
    }
}

// =============================================================================
// Pool endpoints
// =============================================================================

/// Reads `GET {endpoint}/v1/contributions?cursor=<c>`.
pub struct HttpPoolSource {
    client: reqwest::Client,
}

impl HttpPoolSource {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl PoolSource for HttpPoolSource {
    async fn fetch_records(
        &self,
        endpoint: &str,
        cursor: Option<&str>,
    ) -> Result<RecordPage, ClientError> {
        let url = format!("{}/v1/contributions", trim_base(endpoint));

        let mut request = self.client.get(&url);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await.map_err(|e| transport(&url, e))?;
        let page: RecordPage = read_json(&url, response).await?;

        debug!(
            url = %url,
            records = page.records.len(),
            has_cursor = page.next_cursor.is_some(),
            "Fetched contribution page"
        );
        Ok(page)
    }
}

// =============================================================================
// Ledger
// =============================================================================

#[derive(Debug, Deserialize)]
struct BlockHeight {
    height: u64,
}

/// Ledger over `GET {network}/v1/blocks/current` and
/// `POST {network}/v1/weights`.
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn current_block(&self) -> Result<u64, ClientError> {
        let url = format!("{}/v1/blocks/current", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        let height: BlockHeight = read_json(&url, response).await?;
        Ok(height.height)
    }

    async fn submit_weights(&self, submission: &WeightSubmission) -> Result<(), ClientError> {
        let url = format!("{}/v1/weights", self.base_url);
        debug!(
            commit_id = %submission.commit_id,
            epoch = %submission.epoch,
            subjects = submission.weights.len(),
            "Submitting weights"
        );

        let response = self
            .client
            .post(&url)
            .json(submission)
            .send()
            .await
            .map_err(|e| transport(&url, e))?;
        check_status(&url, response).await?;
        Ok(())
    }
}
