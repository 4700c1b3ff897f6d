use crate::chunking::normalize_text;
use crate::error::{PipelineError, Result};
use crate::models::EventRecord;
use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

const MISSING_TITLE: &str = "Titre manquant";
const DEFAULT_REGION: &str = "Île-de-France";

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRecord {
    pub position: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub documents: Vec<EventRecord>,
    pub skipped: Vec<SkippedRecord>,
}

pub fn load_documents(path: &Path) -> Result<LoadReport> {
    let raw = fs::read_to_string(path)?;
    let report = parse_documents(&raw)?;
    info!(
        path = %path.display(),
        documents = report.documents.len(),
        skipped = report.skipped.len(),
        "loaded event records"
    );
    Ok(report)
}

/// Parses a JSON array of event records, skipping the ones that fail validation.
pub fn parse_documents(raw: &str) -> Result<LoadReport> {
    let parsed: Value = serde_json::from_str(raw)?;
    let Value::Array(items) = parsed else {
        return Err(PipelineError::Validation(
            "source documents must be a JSON array of records".to_string(),
        ));
    };

    let mut report = LoadReport::default();
    for (position, item) in items.into_iter().enumerate() {
        match parse_record(item) {
            Ok(record) => report.documents.push(record),
            Err(error) => {
                warn!(position, reason = %error, "skipping event record");
                report.skipped.push(SkippedRecord {
                    position,
                    reason: error.to_string(),
                });
            }
        }
    }

    Ok(report)
}

pub fn parse_record(value: Value) -> Result<EventRecord> {
    let raw: RawEventRecord = serde_json::from_value(value)
        .map_err(|error| PipelineError::Validation(format!("malformed record: {error}")))?;

    let id = raw
        .id
        .map(RawId::into_string)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| PipelineError::Validation("record has no id".to_string()))?;

    let text_to_embed = raw.text_to_embed.ok_or_else(|| {
        PipelineError::Validation(format!("record {id} has no text_to_embed field"))
    })?;

    Ok(EventRecord {
        title: non_empty(raw.title).unwrap_or_else(|| MISSING_TITLE.to_string()),
        url: non_empty(raw.url),
        date_start: raw.date_start.and_then(RawDate::into_rfc3339),
        date_end: raw.date_end.and_then(RawDate::into_rfc3339),
        city: non_empty(raw.city),
        region: non_empty(raw.region).unwrap_or_else(|| DEFAULT_REGION.to_string()),
        keywords: raw.keywords.map(RawKeywords::into_list).unwrap_or_default(),
        text_to_embed: normalize_text(&text_to_embed),
        id,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|text| normalize_text(&text))
        .filter(|text| !text.is_empty())
}

#[derive(Debug, Deserialize)]
struct RawEventRecord {
    #[serde(default)]
    id: Option<RawId>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    date_start: Option<RawDate>,
    #[serde(default)]
    date_end: Option<RawDate>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    keywords: Option<RawKeywords>,
    #[serde(default)]
    text_to_embed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(serde_json::Number),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Number(number) => number.to_string(),
        }
    }
}

/// Dates arrive either as ISO-8601 strings or as epoch milliseconds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDate {
    EpochMillis(i64),
    Text(String),
}

impl RawDate {
    fn into_rfc3339(self) -> Option<String> {
        match self {
            Self::EpochMillis(millis) => {
                DateTime::from_timestamp_millis(millis).map(|date| date.to_rfc3339())
            }
            Self::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Some(
                    DateTime::parse_from_rfc3339(trimmed)
                        .map(|date| date.to_rfc3339())
                        .unwrap_or_else(|_| trimmed.to_string()),
                )
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawKeywords {
    List(Vec<Option<String>>),
    Text(String),
}

impl RawKeywords {
    fn into_list(self) -> Vec<String> {
        let items = match self {
            Self::List(items) => items.into_iter().flatten().collect(),
            Self::Text(text) => split_keyword_text(&text),
        };
        items
            .into_iter()
            .map(|keyword| keyword.trim().to_string())
            .filter(|keyword| !keyword.is_empty())
            .collect()
    }
}

fn split_keyword_text(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
        return list;
    }

    trimmed
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split([',', ';'])
        .map(|part| part.trim().trim_matches(['\'', '"']).to_string())
        .collect()
}
