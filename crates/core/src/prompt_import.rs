//! Prompt list extraction from uploaded files.

use anyhow::{bail, Context, Result};
use serde_json::Value;

/// Record fields consulted, in order, when a JSON record holds the prompt.
const PROMPT_FIELDS: [&str; 3] = ["prompt", "text", "description"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptFormat {
    Text,
    Json,
    Csv,
}

impl PromptFormat {
    /// Pick a format from the file extension, falling back to sniffing the
    /// content.
    pub fn detect(file_name: Option<&str>, content: &str) -> Self {
        let extension = file_name
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("json") => return Self::Json,
            Some("csv") => return Self::Csv,
            Some("txt") => return Self::Text,
            _ => {}
        }

        let trimmed = content.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            Self::Json
        } else {
            Self::Text
        }
    }
}

pub fn extract_prompts(file_name: Option<&str>, content: &str) -> Result<Vec<String>> {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    let prompts = match PromptFormat::detect(file_name, content) {
        PromptFormat::Text => from_text(content),
        PromptFormat::Json => from_json(content)?,
        PromptFormat::Csv => from_csv(content)?,
    };
    Ok(prompts)
}

fn from_text(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn from_json(content: &str) -> Result<Vec<String>> {
    let value: Value = serde_json::from_str(content).context("invalid JSON prompt file")?;
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(mut object) => match object.remove("prompts") {
            Some(Value::Array(entries)) => entries,
            _ => bail!("JSON object must contain a \"prompts\" array"),
        },
        _ => bail!("JSON prompt file must be an array or an object with \"prompts\""),
    };

    Ok(entries.iter().filter_map(prompt_from_value).collect())
}

fn prompt_from_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.as_str(),
        Value::Object(record) => PROMPT_FIELDS
            .iter()
            .find_map(|field| record.get(*field).and_then(Value::as_str))
            .or_else(|| record.values().find_map(Value::as_str))?,
        _ => return None,
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Use the `prompt` column when the header names one, otherwise the first
/// column of every row.
fn from_csv(content: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record.context("invalid CSV prompt file")?);
    }

    let header_column = rows.first().and_then(|header| {
        header
            .iter()
            .position(|cell| PROMPT_FIELDS.contains(&cell.to_ascii_lowercase().as_str()))
    });
    let (column, skip) = match header_column {
        Some(column) => (column, 1),
        None => (0, 0),
    };

    Ok(rows
        .iter()
        .skip(skip)
        .filter_map(|row| row.get(column))
        .filter(|cell| !cell.is_empty())
        .map(str::to_string)
        .collect())
}
