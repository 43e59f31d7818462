//! Tools over the user's stored files

use super::{Artifact, Tool, ToolContext, ToolOutput, ToolServerError, FILE_REF_FORMAT};
use crate::storage::FileRef;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

/// Summarize an uploaded file
pub struct InspectFileTool;

#[derive(Debug, Deserialize)]
struct InspectInput {
    file: String,
}

#[async_trait]
impl Tool for InspectFileTool {
    fn name(&self) -> &'static str {
        "inspect"
    }

    fn description(&self) -> String {
        "Report the size, line count and word count of an uploaded file, plus its first lines if it is text. Pass the file's name as shown to the user.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["file"],
            "properties": {
                "file": {
                    "type": "string",
                    "format": FILE_REF_FORMAT,
                    "description": "Name of an uploaded file"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolServerError> {
        let input: InspectInput = serde_json::from_value(input)
            .map_err(|e| ToolServerError::InvalidInput(e.to_string()))?;
        // Names of uploaded files are replaced with references before the call
        let reference = FileRef::parse(&input.file).ok_or_else(|| {
            ToolServerError::Failed(format!("No uploaded file named '{}'", input.file))
        })?;

        ctx.report_progress("Reading file");
        let bytes = ctx.read_file(&reference).await?;

        let summary = match std::str::from_utf8(&bytes) {
            Ok(text) => {
                let preview: Vec<&str> = text.lines().take(5).collect();
                format!(
                    "{} bytes, {} lines, {} words\n{}",
                    bytes.len(),
                    text.lines().count(),
                    text.split_whitespace().count(),
                    preview.join("\n")
                )
            }
            Err(_) => format!("{} bytes of binary data", bytes.len()),
        };
        Ok(ToolOutput::text(summary))
    }
}

/// Produce a downloadable text file
pub struct WriteFileTool;

#[derive(Debug, Deserialize)]
struct WriteInput {
    name: String,
    content: String,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write"
    }

    fn description(&self) -> String {
        "Create a text file the user can download, e.g. a CSV export or a drafted document.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["name", "content"],
            "properties": {
                "name": {"type": "string", "description": "File name including extension"},
                "content": {"type": "string", "description": "Full file content"}
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> Result<ToolOutput, ToolServerError> {
        let input: WriteInput = serde_json::from_value(input)
            .map_err(|e| ToolServerError::InvalidInput(e.to_string()))?;
        if input.name.trim().is_empty() || input.name.contains('/') {
            return Err(ToolServerError::InvalidInput(format!(
                "Invalid file name '{}'",
                input.name
            )));
        }
        let media_type = if input.name.ends_with(".csv") {
            "text/csv"
        } else {
            "text/plain"
        };
        Ok(
            ToolOutput::text(format!("Created {} ({} bytes)", input.name, input.content.len()))
                .with_artifact(Artifact {
                    name: input.name,
                    media_type: media_type.to_string(),
                    data: input.content.into_bytes(),
                }),
        )
    }
}
