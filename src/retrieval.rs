//! Retrieval integration: discovery of authorized sources and grounded
//! answers from them

mod http;

pub use http::HttpRetrievalClient;

use crate::error::TurnError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// Transport or upstream failure that may succeed on retry
    #[error("retrieval service unavailable: {0}")]
    Unavailable(String),
    #[error("retrieval request rejected: {0}")]
    Rejected(String),
}

impl RetrievalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetrievalError::Unavailable(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAttribution {
    pub source_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalAnswer {
    pub answer: String,
    #[serde(default)]
    pub attributions: Vec<SourceAttribution>,
}

/// External retrieval service
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Sources `user` may query
    async fn discover(&self, user: &str) -> Result<Vec<String>, RetrievalError>;

    async fn query(
        &self,
        user: &str,
        sources: &[String],
        text: &str,
    ) -> Result<RetrievalAnswer, RetrievalError>;
}

pub struct RetrievalIntegrator {
    service: Option<Arc<dyn RetrievalService>>,
}

impl RetrievalIntegrator {
    pub fn new(service: Option<Arc<dyn RetrievalService>>) -> Self {
        Self { service }
    }

    pub fn disabled() -> Self {
        Self { service: None }
    }

    /// Sources the user is authorized for. Empty when retrieval is not
    /// configured.
    pub async fn discover(&self, user: &str) -> Result<BTreeSet<String>, TurnError> {
        let Some(service) = &self.service else {
            return Ok(BTreeSet::new());
        };
        let sources = with_retry("discover", || service.discover(user)).await?;
        Ok(sources.into_iter().collect())
    }

    /// Query the requested sources, restricted to those the user is
    /// authorized for
    pub async fn query(
        &self,
        user: &str,
        requested: &BTreeSet<String>,
        text: &str,
    ) -> Result<RetrievalAnswer, TurnError> {
        let Some(service) = &self.service else {
            return Err(TurnError::validation("Retrieval is not configured"));
        };

        let authorized = self.discover(user).await?;
        let sources: Vec<String> = requested.intersection(&authorized).cloned().collect();
        if sources.len() < requested.len() {
            tracing::warn!(
                user_id = %user,
                requested = requested.len(),
                authorized = sources.len(),
                "Dropping unauthorized data sources"
            );
        }
        if sources.is_empty() {
            return Err(TurnError::validation(
                "None of the selected data sources are available to you",
            ));
        }

        let answer = with_retry("query", || service.query(user, &sources, text)).await?;
        tracing::info!(
            sources = sources.len(),
            attributions = answer.attributions.len(),
            "Retrieval answered"
        );
        Ok(answer)
    }
}

/// Prompt text for a model call grounded on a retrieval answer
pub fn grounded_prompt(answer: &RetrievalAnswer, text: &str) -> String {
    let mut prompt = String::from("Relevant information from the selected data sources:\n\n");
    prompt.push_str(answer.answer.trim());
    if !answer.attributions.is_empty() {
        prompt.push_str("\n\nSources:");
        for attribution in &answer.attributions {
            prompt.push_str("\n- ");
            prompt.push_str(&attribution.title);
        }
    }
    prompt.push_str("\n\nQuestion:\n");
    prompt.push_str(text);
    prompt
}

/// Retry once on transient failure
async fn with_retry<T, F, Fut>(operation: &str, mut call: F) -> Result<T, RetrievalError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RetrievalError>>,
{
    match call().await {
        Err(e) if e.is_retryable() => {
            tracing::warn!(operation, error = %e, "Retrieval failed, retrying once");
            tokio::time::sleep(RETRY_DELAY).await;
            call().await
        }
        other => other,
    }
}
