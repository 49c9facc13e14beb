use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata generated for one vault file.
///
/// `summary` and `highlights` are mandatory.  Anything else the model returns
/// (tags, people, dates...) is carried through untouched in `extra` so it
/// reaches both the sidecar and the external record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub summary: String,
    pub highlights: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The slice of a document kept in `index.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexEntry {
    pub summary: String,
    pub highlights: Vec<String>,
}

impl MetadataDocument {
    pub fn new(summary: impl Into<String>, highlights: Vec<String>) -> Self {
        Self {
            summary: summary.into(),
            highlights,
            extra: Map::new(),
        }
    }

    /// Validate an arbitrary JSON value and turn it into a document.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(object) = &value else {
            bail!("metadata must be a JSON object");
        };
        match object.get("summary") {
            Some(Value::String(_)) => {}
            Some(_) => bail!("metadata field 'summary' must be a string"),
            None => bail!("metadata is missing 'summary'"),
        }
        match object.get("highlights") {
            Some(Value::Array(items)) if items.iter().all(Value::is_string) => {}
            Some(_) => bail!("metadata field 'highlights' must be a list of strings"),
            None => bail!("metadata is missing 'highlights'"),
        }
        serde_json::from_value(value).context("malformed metadata document")
    }

    pub fn index_entry(&self) -> IndexEntry {
        IndexEntry {
            summary: self.summary.clone(),
            highlights: self.highlights.clone(),
        }
    }

    /// Properties of the external record for `path`: the document fields plus
    /// the equality-queryable `path`.
    pub fn record_properties(&self, path: &str) -> Value {
        let mut properties = self.extra.clone();
        properties.insert("summary".to_string(), Value::String(self.summary.clone()));
        properties.insert(
            "highlights".to_string(),
            Value::Array(self.highlights.iter().cloned().map(Value::String).collect()),
        );
        properties.insert("path".to_string(), Value::String(path.to_string()));
        Value::Object(properties)
    }

    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
