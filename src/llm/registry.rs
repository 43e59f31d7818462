//! Model registry: the set of models a turn may name

use super::{AnthropicModel, AnthropicService, LlmService, LoggingService};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Configuration for model providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    /// Gateway base URL; when set the gateway handles authentication
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }
}

/// Public description of a registered model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub description: String,
}

/// Registry of available models
pub struct ModelRegistry {
    services: HashMap<String, Arc<dyn LlmService>>,
    descriptions: HashMap<String, String>,
    default_model: String,
}

impl ModelRegistry {
    /// Create an empty registry; models are added with [`ModelRegistry::register`]
    pub fn new_empty() -> Self {
        Self {
            services: HashMap::new(),
            descriptions: HashMap::new(),
            default_model: AnthropicModel::Sonnet45.model_id().to_string(),
        }
    }

    pub fn new(config: &LlmConfig) -> Self {
        let mut registry = Self::new_empty();

        // In gateway mode the gateway injects credentials
        let api_key = if config.gateway.is_some() {
            Some("implicit".to_string())
        } else {
            config.anthropic_api_key.clone().filter(|k| !k.is_empty())
        };

        if let Some(api_key) = api_key {
            for model in AnthropicModel::ALL {
                match AnthropicService::new(api_key.clone(), model, config.gateway.as_deref()) {
                    Ok(service) => registry.register(Arc::new(service), model.description()),
                    Err(e) => {
                        tracing::warn!(model = model.model_id(), error = %e, "Skipping model");
                    }
                }
            }
        }

        if let Some(default_model) = &config.default_model {
            registry.default_model.clone_from(default_model);
        } else if !registry.services.contains_key(&registry.default_model) {
            if let Some(first) = registry.available_models().into_iter().next() {
                registry.default_model = first;
            }
        }

        registry
    }

    /// Register a service, wrapped for logging
    pub fn register(&mut self, service: Arc<dyn LlmService>, description: &str) {
        let id = service.model_id().to_string();
        self.descriptions.insert(id.clone(), description.to_string());
        self.services
            .insert(id, Arc::new(LoggingService::new(service)));
    }

    /// Get a model by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.services.get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.services.contains_key(model_id)
    }

    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// List all available model IDs, sorted
    pub fn available_models(&self) -> Vec<String> {
        let mut models: Vec<_> = self.services.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn available_model_info(&self) -> Vec<ModelInfo> {
        self.available_models()
            .into_iter()
            .map(|id| ModelInfo {
                description: self.descriptions.get(&id).cloned().unwrap_or_default(),
                id,
            })
            .collect()
    }
}
