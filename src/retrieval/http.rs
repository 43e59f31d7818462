//! HTTP client for the retrieval service
//!
//! `GET {base}/sources?user=<id>` returns `{"sources": [..]}` and
//! `POST {base}/query` takes `{user, sources, text}` and returns a
//! [`RetrievalAnswer`].

use super::{RetrievalAnswer, RetrievalError, RetrievalService};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpRetrievalClient {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SourcesResponse {
    sources: Vec<String>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    user: &'a str,
    sources: &'a [String],
    text: &'a str,
}

impl HttpRetrievalClient {
    pub fn new(base_url: &str) -> Result<Self, RetrievalError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RetrievalError::Rejected(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

fn transport_error(e: &reqwest::Error) -> RetrievalError {
    RetrievalError::Unavailable(e.to_string())
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, RetrievalError> {
    let status = response.status();
    if status.is_server_error() {
        return Err(RetrievalError::Unavailable(format!("HTTP {status}")));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RetrievalError::Rejected(format!("HTTP {status}: {body}")));
    }
    response
        .json()
        .await
        .map_err(|e| RetrievalError::Rejected(format!("Malformed response: {e}")))
}

#[async_trait]
impl RetrievalService for HttpRetrievalClient {
    async fn discover(&self, user: &str) -> Result<Vec<String>, RetrievalError> {
        let response = self
            .client
            .get(format!("{}/sources", self.base_url))
            .query(&[("user", user)])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        let body: SourcesResponse = read_json(response).await?;
        Ok(body.sources)
    }

    async fn query(
        &self,
        user: &str,
        sources: &[String],
        text: &str,
    ) -> Result<RetrievalAnswer, RetrievalError> {
        let response = self
            .client
            .post(format!("{}/query", self.base_url))
            .json(&QueryRequest { user, sources, text })
            .send()
            .await
            .map_err(|e| transport_error(&e))?;
        read_json(response).await
    }
}
