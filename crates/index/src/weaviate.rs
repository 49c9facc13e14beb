use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tracing::debug;

use babel_config::IndexConfig;
use babel_metadata::MetadataDocument;

use crate::{RecordId, VectorIndex};

/// Weaviate REST/GraphQL client scoped to one class.
#[derive(Debug, Clone)]
pub struct WeaviateIndex {
    client: reqwest::Client,
    base_url: String,
    class_name: String,
    api_key: Option<String>,
    openai_api_key: Option<String>,
}

impl WeaviateIndex {
    pub fn from_config(config: &IndexConfig, openai_api_key: Option<&str>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            class_name: config.class_name.clone(),
            api_key: non_empty(&config.api_key),
            openai_api_key: openai_api_key.and_then(non_empty),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, format!("{}{path}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        if let Some(key) = &self.openai_api_key {
            request = request.header("X-OpenAI-Api-Key", key);
        }
        request
    }

    fn object_path(&self, id: &RecordId) -> String {
        format!("/v1/objects/{}/{}", self.class_name, id)
    }
}

#[async_trait]
impl VectorIndex for WeaviateIndex {
    async fn find_by_path(&self, path: &str) -> Result<Option<RecordId>> {
        let body = json!({ "query": path_lookup_query(&self.class_name, path) });
        let response = self
            .request(reqwest::Method::POST, "/v1/graphql")
            .json(&body)
            .send()
            .await
            .context("weaviate lookup request failed")?;
        let reply = json_or_error(response).await?;
        parse_lookup_reply(&self.class_name, &reply)
    }

    async fn create(&self, path: &str, document: &MetadataDocument) -> Result<RecordId> {
        let body = json!({
            "class": self.class_name,
            "properties": document.record_properties(path),
        });
        let response = self
            .request(reqwest::Method::POST, "/v1/objects")
            .json(&body)
            .send()
            .await
            .context("weaviate create request failed")?;
        let reply = json_or_error(response).await?;
        let id = reply
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("weaviate create reply has no id: {reply}"))?;
        debug!(path, id, "weaviate object created");
        Ok(RecordId::new(id))
    }

    async fn update(&self, id: &RecordId, path: &str, document: &MetadataDocument) -> Result<()> {
        let body = json!({
            "class": self.class_name,
            "id": id.as_str(),
            "properties": document.record_properties(path),
        });
        // PATCH merges properties into the stored object.
        let response = self
            .request(reqwest::Method::PATCH, &self.object_path(id))
            .json(&body)
            .send()
            .await
            .context("weaviate update request failed")?;
        expect_success(response, "update").await
    }

    async fn delete(&self, id: &RecordId) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &self.object_path(id))
            .send()
            .await
            .context("weaviate delete request failed")?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%id, "weaviate object already gone");
            return Ok(());
        }
        expect_success(response, "delete").await
    }

    async fn ready(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::GET, "/v1/.well-known/ready")
            .send()
            .await
            .with_context(|| format!("weaviate unreachable at {}", self.base_url))?;
        expect_success(response, "readiness probe").await
    }

    fn name(&self) -> &'static str {
        "weaviate"
    }
}

/// GraphQL `Get` returning the id of the first object whose `path` equals
/// `path`.
fn path_lookup_query(class_name: &str, path: &str) -> String {
    // A JSON string literal is also a valid GraphQL string literal.
    let literal = Value::String(path.to_string()).to_string();
    format!(
        "{{ Get {{ {class_name}(where: {{ path: [\"path\"], operator: Equal, valueText: {literal} }}, limit: 1) {{ path _additional {{ id }} }} }} }}"
    )
}

fn parse_lookup_reply(class_name: &str, reply: &Value) -> Result<Option<RecordId>> {
    if let Some(errors) = reply.get("errors").and_then(Value::as_array) {
        if !errors.is_empty() {
            bail!("weaviate lookup returned errors: {}", Value::Array(errors.clone()));
        }
    }

    let hits = reply
        .pointer(&format!("/data/Get/{class_name}"))
        .and_then(Value::as_array);
    let Some(first) = hits.and_then(|hits| hits.first()) else {
        return Ok(None);
    };
    let id = first
        .pointer("/_additional/id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("weaviate hit has no _additional.id: {first}"))?;
    Ok(Some(RecordId::new(id)))
}

async fn json_or_error(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("weaviate error ({status}): {body}");
    }
    Ok(body)
}

async fn expect_success(response: reqwest::Response, action: &str) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    bail!("weaviate {action} failed ({status}): {body}")
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
