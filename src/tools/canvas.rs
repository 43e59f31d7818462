//! Canvas tool: renders an HTML fragment on the client instead of
//! replying in the conversation

use super::{Tool, ToolContext, ToolKind, ToolOutput, ToolServerError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct CanvasTool;

#[derive(Debug, Deserialize)]
struct RenderInput {
    title: String,
    html: String,
}

#[async_trait]
impl Tool for CanvasTool {
    fn name(&self) -> &'static str {
        "render"
    }

    fn description(&self) -> String {
        "Show rich content (tables, charts, formatted documents) to the user on their canvas. Provide a short title and an HTML fragment. The user sees the rendering; you only get a confirmation back.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["title", "html"],
            "properties": {
                "title": {"type": "string", "description": "Heading shown above the content"},
                "html": {"type": "string", "description": "HTML fragment to display"}
            }
        })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Canvas
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolServerError> {
        let input: RenderInput = serde_json::from_value(input)
            .map_err(|e| ToolServerError::InvalidInput(e.to_string()))?;
        if input.html.trim().is_empty() {
            return Err(ToolServerError::InvalidInput("html is empty".to_string()));
        }
        let fragment = format!(
            "<section class=\"canvas\"><h2>{}</h2>{}</section>",
            input.title, input.html
        );
        Ok(ToolOutput::text(format!("Rendered '{}' on the canvas.", input.title))
            .with_ui_payload(fragment))
    }
}
