//! Trait abstractions for runtime I/O
//!
//! The router only talks to models through [`ModelClient`], so tests can
//! script responses without a provider.

use crate::llm::{LlmError, LlmRequest, LlmResponse, ModelInfo, ModelRegistry};
use async_trait::async_trait;
use std::sync::Arc;

/// Client for making model requests by model id
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn has_model(&self, model_id: &str) -> bool;

    /// Model used when a request names none
    fn default_model_id(&self) -> String;

    fn model_info(&self) -> Vec<ModelInfo>;

    async fn complete(&self, model_id: &str, request: &LlmRequest)
        -> Result<LlmResponse, LlmError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for Arc<T> {
    fn has_model(&self, model_id: &str) -> bool {
        (**self).has_model(model_id)
    }

    fn default_model_id(&self) -> String {
        (**self).default_model_id()
    }

    fn model_info(&self) -> Vec<ModelInfo> {
        (**self).model_info()
    }

    async fn complete(
        &self,
        model_id: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        (**self).complete(model_id, request).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use [`ModelRegistry`] as [`ModelClient`]
#[derive(Clone)]
pub struct RegistryModelClient {
    registry: Arc<ModelRegistry>,
}

impl RegistryModelClient {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ModelClient for RegistryModelClient {
    fn has_model(&self, model_id: &str) -> bool {
        self.registry.contains(model_id)
    }

    fn default_model_id(&self) -> String {
        self.registry.default_model_id().to_string()
    }

    fn model_info(&self) -> Vec<ModelInfo> {
        self.registry.available_model_info()
    }

    async fn complete(
        &self,
        model_id: &str,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let llm = self
            .registry
            .get(model_id)
            .ok_or_else(|| LlmError::invalid_request(format!("Unknown model '{model_id}'")))?;
        llm.complete(request).await
    }
}
