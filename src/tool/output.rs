//! Tool output contract
//!
//! The first non-empty stdout line is a JSON header carrying the
//! machine-readable metadata; everything after it is free-form text captured
//! into the task result. A missing or malformed header is a protocol error,
//! never heuristically parsed.

use serde::{Deserialize, Serialize};

use crate::domain::Priority;

use super::error::ToolError;

/// Follow-up task emitted by a review-pass invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub deps: Vec<String>,
}

/// Header line of the tool's stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct Header {
    tokens_used: u64,
    created_files: Vec<String>,
    modified_files: Vec<String>,
    #[serde(default)]
    new_tasks: Vec<NewTask>,
}

/// Parsed result of one tool invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    /// Free-form explanatory text (everything after the header)
    pub text: String,
    pub created_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub tokens_used: u64,
    /// Only honored on review-pass invocations
    pub new_tasks: Vec<NewTask>,
}

impl ToolOutput {
    /// Parse raw stdout against the output contract
    pub fn parse(stdout: &str) -> Result<Self, ToolError> {
        let mut lines = stdout.lines();
        let header_line = loop {
            match lines.next() {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => return Err(ToolError::Protocol("empty tool output, header missing".to_string())),
            }
        };

        let header: Header = serde_json::from_str(header_line.trim())
            .map_err(|e| ToolError::Protocol(format!("malformed output header: {}", e)))?;

        let text = lines.collect::<Vec<_>>().join("\n").trim().to_string();

        Ok(Self {
            text,
            created_files: header.created_files,
            modified_files: header.modified_files,
            tokens_used: header.tokens_used,
            new_tasks: header.new_tasks,
        })
    }

    /// Render an output back into contract form (test doubles, fixtures)
    pub fn render(&self) -> String {
        let header = Header {
            tokens_used: self.tokens_used,
            created_files: self.created_files.clone(),
            modified_files: self.modified_files.clone(),
            new_tasks: self.new_tasks.clone(),
        };
        let header_json = serde_json::to_string(&header).expect("header serialization");
        format!("{}\n{}", header_json, self.text)
    }
}
