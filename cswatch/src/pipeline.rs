//! Aggregation pipeline parsing for change stream filters.
//!
//! A pipeline is given as a JSON array of stage objects, e.g.
//! `[{"$match": {"operationType": "update"}}]`. Stages are converted to BSON
//! using relaxed extended JSON rules and are otherwise passed through
//! untouched: the server is the only judge of whether a stage is valid.

use mongodb::bson::Document;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Pipeline is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Pipeline must be a JSON array of stages, got {0}")]
    NotArray(&'static str),
    #[error("Pipeline stage {index} must be a JSON object, got {found}")]
    NotObject { index: usize, found: &'static str },
    #[error("Pipeline stage {index} is not valid extended JSON: {source}")]
    ExtJson {
        index: usize,
        #[source]
        source: mongodb::bson::extjson::de::Error,
    },
}

/// Parse a JSON array of aggregation stages.
///
/// Empty or whitespace-only input yields an empty pipeline. Any malformed
/// input fails as a whole, no partial pipeline is ever returned.
pub fn parse(text: &str) -> Result<Vec<Document>, Error> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let stages = match serde_json::from_str::<Value>(text)? {
        Value::Array(stages) => stages,
        other => return Err(Error::NotArray(kind_of(&other))),
    };

    stages
        .into_iter()
        .enumerate()
        .map(|(index, stage)| match stage {
            Value::Object(map) => {
                Document::try_from(map).map_err(|source| Error::ExtJson { index, source })
            }
            other => Err(Error::NotObject {
                index,
                found: kind_of(&other),
            }),
        })
        .collect()
}

/// Like [`parse`], treating an absent pipeline as empty.
pub fn parse_opt(text: Option<&str>) -> Result<Vec<Document>, Error> {
    text.map_or_else(|| Ok(Vec::new()), parse)
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
