//! Typed parsing of provider responses
//!
//! Providers answer with loosely structured JSON; each agent expects a
//! specific shape. When the payload is an object that misses the expected
//! fields, it is gracefully converted into `ResultData::Degraded` so one
//! malformed response does not sink the whole stage. Only a payload that is
//! not an object at all is a schema error.

use serde_json::Value;

use crate::types::{
    project_first_string, AgentType, ConceptExplanation, ProviderError, QualityFinding, ResultData,
};

/// Parse a provider response body into the agent's typed result.
pub fn parse_result(agent: AgentType, body: &Value) -> Result<ResultData, ProviderError> {
    let effective = unwrap_content(body);

    if let Some(data) = typed_result(agent, &effective) {
        return Ok(data);
    }

    match effective {
        Value::Object(raw) => {
            tracing::warn!(agent = %agent, "response did not match expected shape, degrading");
            Ok(ResultData::Degraded { raw })
        }
        other => Err(ProviderError::Schema {
            provider: agent.provider().to_string(),
            message: format!("expected a JSON object, got {}", kind_of(&other)),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// LLM providers wrap their answer in `{"content": "..."}`. When the
/// content itself is serialized JSON, unwrap it so the typed extraction
/// sees the real payload.
fn unwrap_content(body: &Value) -> Value {
    if let Some(content) = body.get("content").and_then(Value::as_str) {
        if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(content.trim()) {
            return parsed;
        }
    }
    body.clone()
}

fn typed_result(agent: AgentType, body: &Value) -> Option<ResultData> {
    match agent {
        AgentType::PaperProcessor => {
            let text = project_first_string(
                body,
                &["text", "textContent", "extractedText", "content"],
            )?;
            Some(ResultData::ExtractedText {
                text,
                page_count: body
                    .get("pageCount")
                    .or_else(|| body.get("page_count"))
                    .and_then(Value::as_u64)
                    .map(|n| n as u32),
            })
        }
        AgentType::MetadataEnhancer => {
            // Crossref answers with an items list; take the best match.
            let record = body
                .get("items")
                .and_then(|items| items.get(0))
                .unwrap_or(body);
            let title = title_of(record)?;
            Some(ResultData::Metadata {
                title: Some(title),
                authors: authors_of(record),
                doi: record
                    .get("DOI")
                    .or_else(|| record.get("doi"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                journal: project_first_string(
                    record,
                    &["journal", "venue", "publisher"],
                ),
                year: record
                    .get("year")
                    .and_then(Value::as_i64)
                    .map(|y| y as i32),
            })
        }
        AgentType::ContentSummarizer => {
            let brief = project_first_string(body, &["brief", "summary", "content", "text"])?;
            Some(ResultData::Summary {
                brief,
                standard: project_first_string(body, &["standard"]),
                detailed: project_first_string(body, &["detailed"]),
            })
        }
        AgentType::ConceptExplainer => {
            let raw = body.get("concepts").or_else(|| body.get("explanations"))?;
            let explanations: Vec<ConceptExplanation> =
                serde_json::from_value(raw.clone()).ok()?;
            Some(ResultData::Concepts { explanations })
        }
        AgentType::QualityChecker => {
            let overall_score = body
                .get("overallScore")
                .or_else(|| body.get("overall_score"))
                .or_else(|| body.get("score"))
                .and_then(Value::as_f64)?;
            let findings = body
                .get("findings")
                .or_else(|| body.get("checks"))
                .and_then(|raw| serde_json::from_value::<Vec<QualityFinding>>(raw.clone()).ok())
                .unwrap_or_default();
            Some(ResultData::Quality {
                overall_score,
                findings,
            })
        }
        AgentType::CitationFormatter => {
            let raw = body.get("formatted").or_else(|| body.get("citations"))?;
            let formatted: Vec<String> = serde_json::from_value(raw.clone()).ok()?;
            Some(ResultData::Citations {
                style: project_first_string(body, &["style"]).unwrap_or_else(|| "APA".to_string()),
                formatted,
            })
        }
        AgentType::CitationVerifier => {
            let verified = body
                .get("verified")
                .or_else(|| body.get("verifiedCount"))
                .and_then(Value::as_u64)? as u32;
            let unverified = body
                .get("unverified")
                .or_else(|| body.get("unverifiedCount"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            Some(ResultData::CitationVerification {
                verified,
                unverified,
                details: body.get("details").cloned().unwrap_or(Value::Null),
            })
        }
        AgentType::PerplexityResearcher => {
            let findings = project_first_string(body, &["findings", "answer", "content"])?;
            let sources = body
                .get("sources")
                .and_then(|raw| serde_json::from_value::<Vec<String>>(raw.clone()).ok())
                .unwrap_or_default();
            Some(ResultData::Research { findings, sources })
        }
        AgentType::RelatedPaperDiscovery => {
            let papers = body.get("papers").or_else(|| body.get("data"))?;
            if papers.is_null() {
                return None;
            }
            Some(ResultData::RelatedPapers {
                papers: papers.clone(),
            })
        }
    }
}

fn title_of(record: &Value) -> Option<String> {
    // Crossref titles arrive as a one-element array.
    if let Some(first) = record
        .get("title")
        .and_then(Value::as_array)
        .and_then(|titles| titles.first())
        .and_then(Value::as_str)
    {
        return Some(first.to_string());
    }
    project_first_string(record, &["title", "paperTitle"])
}

fn authors_of(record: &Value) -> Vec<String> {
    let Some(raw) = record.get("authors").or_else(|| record.get("author")) else {
        return Vec::new();
    };
    let Some(entries) = raw.as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(name.clone()),
            Value::Object(fields) => {
                if let Some(name) = fields.get("name").and_then(Value::as_str) {
                    Some(name.to_string())
                } else {
                    let given = fields.get("given").and_then(Value::as_str).unwrap_or("");
                    let family = fields.get("family").and_then(Value::as_str).unwrap_or("");
                    let full = format!("{given} {family}").trim().to_string();
                    (!full.is_empty()).then_some(full)
                }
            }
            _ => None,
        })
        .collect()
}
