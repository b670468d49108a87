//! Code cell outputs in nbformat v4 shape.
//!
//! nbformat allows multiline text either as a string or as a list of line
//! fragments. Both are accepted on read and normalized to a single string,
//! so an output always writes back as a string.

use std::collections::BTreeMap;

use base64::prelude::*;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// mime type → payload
pub type MimeBundle = BTreeMap<String, Value>;

/// Mime types the editor knows how to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MimeType {
    Plain,
    Html,
    Png,
    Json,
}

impl MimeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MimeType::Plain => "text/plain",
            MimeType::Html => "text/html",
            MimeType::Png => "image/png",
            MimeType::Json => "application/json",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    Stream {
        name: StreamName,
        #[serde(deserialize_with = "deserialize_multiline")]
        text: String,
    },
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
    ExecuteResult {
        execution_count: Option<i64>,
        #[serde(deserialize_with = "deserialize_bundle")]
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    DisplayData {
        #[serde(deserialize_with = "deserialize_bundle")]
        data: MimeBundle,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
}

impl Output {
    pub fn stream_stdout(text: impl Into<String>) -> Self {
        Output::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    /// Parse one nbformat output record.
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }

    pub fn to_record(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn output_type(&self) -> &'static str {
        match self {
            Output::Stream { .. } => "stream",
            Output::Error { .. } => "error",
            Output::ExecuteResult { .. } => "execute_result",
            Output::DisplayData { .. } => "display_data",
        }
    }

    pub fn data(&self) -> Option<&MimeBundle> {
        match self {
            Output::ExecuteResult { data, .. } | Output::DisplayData { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Richest mime type present in the bundle, in presentation preference.
    pub fn preferred_mime(&self) -> Option<MimeType> {
        let data = self.data()?;
        [MimeType::Png, MimeType::Html, MimeType::Json, MimeType::Plain]
            .into_iter()
            .find(|m| data.contains_key(m.as_str()))
    }

    /// Text a terminal can show for this output.
    pub fn plain_text(&self) -> Option<String> {
        match self {
            Output::Stream { text, .. } => Some(text.clone()),
            Output::Error { traceback, .. } => Some(traceback.join("\n")),
            Output::ExecuteResult { data, .. } | Output::DisplayData { data, .. } => {
                match data.get(MimeType::Plain.as_str())? {
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                }
            }
        }
    }

    /// Decode the `image/png` payload, if present.
    pub fn png_bytes(&self) -> Option<Result<Vec<u8>, base64::DecodeError>> {
        let encoded = self.data()?.get(MimeType::Png.as_str())?.as_str()?;
        // nbformat writers may wrap base64 across lines
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        Some(BASE64_STANDARD.decode(compact))
    }
}

/// Accept either `"text"` or `["te", "xt"]`.
fn deserialize_multiline<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Multiline {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Multiline::deserialize(deserializer)? {
        Multiline::One(s) => s,
        Multiline::Many(parts) => parts.concat(),
    })
}

/// Join line-fragment lists for textual mime types; JSON payloads stay as-is.
fn deserialize_bundle<'de, D>(deserializer: D) -> Result<MimeBundle, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(mime, value)| {
            let value = if is_json_mime(&mime) {
                value
            } else {
                join_fragments(value)
            };
            (mime, value)
        })
        .collect())
}

fn is_json_mime(mime: &str) -> bool {
    mime == MimeType::Json.as_str() || mime.ends_with("+json")
}

fn join_fragments(value: Value) -> Value {
    match value {
        Value::Array(items) if items.iter().all(Value::is_string) => Value::String(
            items
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .concat(),
        ),
        other => other,
    }
}
