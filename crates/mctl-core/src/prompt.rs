use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use mctl_types::{Role, Task};

use crate::intent::IntentClass;
use crate::ToolSchema;

pub struct PromptInput<'a> {
    pub role: &'a Role,
    pub task: &'a Task,
    pub intent: &'a IntentClass,
    pub sub_prompt: Option<&'a str>,
    pub revision_note: Option<&'a str>,
    pub tools: &'a [ToolSchema],
}

pub fn compose_prompt(input: PromptInput<'_>) -> String {
    let mut sections = Vec::new();

    if let Some(note) = input
        .revision_note
        .map(str::trim)
        .filter(|note| !note.is_empty())
    {
        sections.push(format!(
            "## Revision Required (mandatory)\n\
A human reviewer rejected the previous result with this note:\n\n> {}\n\n\
Start your answer with a section titled \"Feedback Applied Checklist\" that lists each point of \
the note and how it was addressed, then give the full revised content.",
            note.replace('\n', "\n> ")
        ));
    }

    if !input.role.system_prompt.trim().is_empty() {
        sections.push(input.role.system_prompt.trim().to_string());
    }

    sections.push(format!(
        "[routing] role={} intent={} score={}",
        input.role.id, input.intent.domain, input.intent.score
    ));

    sections.push(format!(
        "## Task\nTitle: {}\nObjective: {}",
        input.task.title.trim(),
        input.task.objective.trim()
    ));

    if let Some(sub) = input.sub_prompt.map(str::trim).filter(|s| !s.is_empty()) {
        sections.push(sub.to_string());
    }

    if let Some(payload) = input.task.context_payload.as_ref() {
        if let Ok(rendered) = serde_json::to_string_pretty(payload) {
            sections.push(format!("## Context\n```json\n{rendered}\n```"));
        }
    }

    if input.task.is_master() {
        sections.push(format!(
            "## Output Format (mandatory)\n\
Begin with the domain tag `[{}]` on its own line. Follow it with an \"Executive Summary\" of \
exactly 3 lines, then the full report in markdown.",
            input.intent.domain.to_ascii_uppercase()
        ));
    }

    if !input.tools.is_empty() {
        let list = input
            .tools
            .iter()
            .map(|tool| format!("- {}: {}", tool.name, tool.description))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("## Available Tools\n{list}"));
    }

    sections.join("\n\n")
}

/// Removes internal handoff JSON the model sometimes leaks into its final answer.
pub fn strip_handoff_fragment(text: &str) -> String {
    static FENCED: OnceLock<Option<Regex>> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*\{.*?\}\s*```").ok());

    let mut cleaned = text.to_string();
    if let Some(re) = fenced {
        cleaned = re
            .replace_all(&cleaned, |caps: &regex::Captures<'_>| {
                let block = &caps[0];
                if block.contains("\"handoff\"") || block.contains("\"next_role\"") {
                    String::new()
                } else {
                    block.to_string()
                }
            })
            .into_owned();
    }

    let trimmed = cleaned.trim_end();
    if trimmed.ends_with('}') {
        if let Some(start) = trailing_object_start(trimmed) {
            let candidate = &trimmed[start..];
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
                if map.contains_key("handoff") || map.contains_key("next_role") {
                    return trimmed[..start].trim_end().to_string();
                }
            }
        }
    }
    cleaned.trim().to_string()
}

/// Byte offset of the `{` balancing the final `}`.
fn trailing_object_start(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (idx, ch) in text.char_indices().rev() {
        match ch {
            '}' => depth += 1,
            '{' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}
