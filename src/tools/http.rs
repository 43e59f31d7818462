//! Remote tool server over HTTP
//!
//! `GET {url}/tools` lists [`ToolSpec`]s. `POST {url}/call` takes
//! `{tool, arguments, context}` and returns
//! `{content, artifacts?, ui_payload?}` or `{error}`. Artifact data is
//! base64 encoded.

use super::{Artifact, ServerPolicy, ToolContext, ToolOutput, ToolServer, ToolServerError, ToolSpec};
use crate::config::ToolServerConfig;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub struct HttpToolServer {
    name: String,
    base_url: String,
    policy: ServerPolicy,
    client: Client,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    tool: &'a str,
    arguments: Value,
    context: CallContext<'a>,
}

#[derive(Serialize)]
struct CallContext<'a> {
    user_id: &'a str,
    session_id: &'a str,
    turn_id: &'a str,
    call_id: &'a str,
}

#[derive(Deserialize)]
struct WireArtifact {
    name: String,
    #[serde(default = "default_media_type")]
    media_type: String,
    data: String,
}

fn default_media_type() -> String {
    "application/octet-stream".to_string()
}

#[derive(Deserialize)]
struct CallResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    artifacts: Vec<WireArtifact>,
    #[serde(default)]
    ui_payload: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpToolServer {
    pub fn from_config(config: &ToolServerConfig) -> Result<Self, ToolServerError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ToolServerError::Unavailable(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            name: config.name.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            policy: ServerPolicy {
                required_groups: config.required_groups.iter().cloned().collect(),
                exclusive: config.exclusive,
                sequential: config.sequential,
            },
            client,
        })
    }

    async fn post_call(&self, tool: &str, arguments: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolServerError> {
        let request = CallRequest {
            tool,
            arguments,
            context: CallContext {
                user_id: &ctx.user_id,
                session_id: &ctx.session_id,
                turn_id: &ctx.turn_id,
                call_id: &ctx.call_id,
            },
        };
        let response = self
            .client
            .post(format!("{}/call", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolServerError::Unavailable(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolServerError::Unavailable(e.to_string()))?;
        let parsed: Option<CallResponse> = serde_json::from_str(&body).ok();

        if !status.is_success() {
            let reason = parsed
                .and_then(|r| r.error)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(if status.is_server_error() {
                ToolServerError::Unavailable(reason)
            } else {
                ToolServerError::Failed(reason)
            });
        }

        let parsed = parsed.ok_or_else(|| {
            ToolServerError::Failed(format!("Malformed response from tool server '{}'", self.name))
        })?;
        decode_response(parsed)
    }
}

fn decode_response(response: CallResponse) -> Result<ToolOutput, ToolServerError> {
    if let Some(error) = response.error {
        return Err(ToolServerError::Failed(error));
    }
    let artifacts = response
        .artifacts
        .into_iter()
        .map(|a| {
            let data = base64::engine::general_purpose::STANDARD
                .decode(a.data.as_bytes())
                .map_err(|e| ToolServerError::Failed(format!("Artifact '{}' is not base64: {e}", a.name)))?;
            Ok(Artifact {
                name: a.name,
                media_type: a.media_type,
                data,
            })
        })
        .collect::<Result<Vec<_>, ToolServerError>>()?;
    Ok(ToolOutput {
        content: response.content,
        artifacts,
        ui_payload: response.ui_payload,
    })
}

#[async_trait]
impl ToolServer for HttpToolServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &ServerPolicy {
        &self.policy
    }

    async fn list_tools(&self) -> Result<Vec<ToolSpec>, ToolServerError> {
        let response = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()
            .await
            .map_err(|e| ToolServerError::Unavailable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ToolServerError::Unavailable(format!(
                "HTTP {} listing tools",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ToolServerError::Failed(format!("Malformed tool list: {e}")))
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolServerError> {
        tokio::select! {
            () = ctx.cancel.cancelled() => Err(ToolServerError::Failed("Cancelled".to_string())),
            result = self.post_call(tool, arguments, &ctx) => result,
        }
    }
}
