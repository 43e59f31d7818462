//! System prompt construction for each execution path

use crate::llm::SystemContent;
use crate::state_machine::{ASK_USER_TOOL, FINAL_ANSWER_TOOL};
use chrono::{DateTime, Utc};
use std::fmt::Write;

/// Base system prompt establishing the assistant's role
const BASE_PROMPT: &str = r"You are a helpful assistant in a multi-user chat workspace. Answer clearly and concisely. When information from the user's data sources is included with a question, prefer it over your own knowledge and say so when it does not cover the question.";

const TOOLS_SUFFIX: &str = r"

You can call the tools offered with this message. Call a tool when it gives a more reliable answer than working it out yourself, for example arithmetic or reading an uploaded file. If a tool call fails, the failure reason is returned to you; explain it to the user instead of retrying blindly. Files the user uploaded can be passed to tools by their file name.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptMode {
    Chat,
    Tools,
    Agent { max_steps: u32 },
}

/// Build the system prompt for `mode`
pub fn build_system_prompt(mode: PromptMode, now: DateTime<Utc>) -> String {
    let mut prompt = String::from(BASE_PROMPT);
    let _ = write!(prompt, "\n\nToday's date is {}.", now.format("%Y-%m-%d"));

    match mode {
        PromptMode::Chat => {}
        PromptMode::Tools => prompt.push_str(TOOLS_SUFFIX),
        PromptMode::Agent { max_steps } => {
            prompt.push_str(TOOLS_SUFFIX);
            let _ = write!(
                prompt,
                "\n\nWork through the task step by step. Each reply you give is one step and you have at most {max_steps} steps. \
                 When the task is done, call {FINAL_ANSWER_TOOL} with your complete answer. \
                 If you cannot continue without information only the user has, call {ASK_USER_TOOL} with one specific question."
            );
        }
    }

    prompt
}

/// System content block for `mode`, marked cacheable
pub fn system_content(mode: PromptMode) -> Vec<SystemContent> {
    vec![SystemContent::cached(build_system_prompt(mode, Utc::now()))]
}
