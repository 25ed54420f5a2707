//! Toxicity and related scores via Google Jigsaw's Perspective API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use quarry_datasets::{Item, ItemWriter, NewAnnotation};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::WorkerContext;
use crate::processor::{Processor, ProcessorOption, ProcessorRun};

pub const PERSPECTIVE_TYPE: &str = "perspective";

/// Scores a piece of text for a set of attributes.
#[async_trait]
pub trait TextScorer: Send + Sync {
    /// Returns the raw analysis response; scores are read from
    /// `attributeScores.<ATTRIBUTE>.summaryScore.value`.
    async fn score(&self, api_key: &str, text: &str, attributes: &[String]) -> Result<Value>;
}

/// [`TextScorer`] backed by the Perspective `comments:analyze` endpoint.
pub struct PerspectiveClient {
    http: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl PerspectiveClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TextScorer for PerspectiveClient {
    async fn score(&self, api_key: &str, text: &str, attributes: &[String]) -> Result<Value> {
        let resp: Value = self
            .http
            .post(&self.endpoint)
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&analyze_request(text, attributes))
            .send()
            .await
            .context("failed to reach Perspective API")?
            .error_for_status()
            .context("Perspective API returned error status")?
            .json()
            .await
            .context("failed to parse Perspective API response")?;
        Ok(resp)
    }
}

fn analyze_request(text: &str, attributes: &[String]) -> Value {
    let requested: Map<String, Value> = attributes
        .iter()
        .map(|a| (a.clone(), json!({})))
        .collect();
    json!({
        "comment": { "text": text },
        "requestedAttributes": requested,
    })
}

pub struct Perspective {
    scorer: Arc<dyn TextScorer>,
}

impl Perspective {
    pub fn from_context(ctx: &WorkerContext) -> Self {
        let cfg = &ctx.config.perspective;
        Self::with_scorer(Arc::new(PerspectiveClient::new(
            ctx.http.clone(),
            cfg.endpoint.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )))
    }

    pub fn with_scorer(scorer: Arc<dyn TextScorer>) -> Self {
        Self { scorer }
    }
}

#[async_trait]
impl Processor for Perspective {
    fn processor_type(&self) -> &'static str {
        PERSPECTIVE_TYPE
    }

    fn options(&self) -> Vec<ProcessorOption> {
        vec![
            ProcessorOption::sensitive("api_key"),
            ProcessorOption::new("attributes", json!(["TOXICITY"])),
            ProcessorOption::new("write_annotations", json!(true)),
        ]
    }

    async fn process(&self, run: &mut ProcessorRun<'_>) -> Result<()> {
        let api_key = match run.parameter("api_key").and_then(Value::as_str) {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return run.finish_with_error("You need to provide a valid API key"),
        };
        let attributes: Vec<String> = run
            .parameter("attributes")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if attributes.is_empty() {
            return run.finish_with_error("You need to provide at least one attribute to score");
        }
        let write_annotations = run.parameter_bool("write_annotations");

        let mut writer = ItemWriter::create(&run.result_path())?;
        let mut annotations = Vec::new();
        for item in run.source().iter()? {
            let item = item?;
            let body = match item.get("body").and_then(Value::as_str) {
                Some(body) if !body.is_empty() => body,
                _ => continue,
            };
            let item_id = item_id(&item).context("item without an id")?;

            let mut response = match self.scorer.score(&api_key, body, &attributes).await {
                Ok(Value::Object(response)) => response,
                Ok(_) => {
                    run.update_status("Perspective API returned an unexpected response")?;
                    continue;
                }
                Err(e) => {
                    run.update_status(&format!("{e:#}"))?;
                    continue;
                }
            };

            if write_annotations {
                for attribute in &attributes {
                    if let Some(score) = summary_score(&response, attribute) {
                        annotations.push(NewAnnotation::by_processor(
                            &item_id,
                            attribute,
                            score,
                            &run.dataset.owner,
                        ));
                    }
                }
            }
            response.insert("item_id".to_string(), Value::String(item_id));
            response.insert("body".to_string(), Value::String(body.to_string()));
            writer.write(&response)?;
        }

        if write_annotations && !annotations.is_empty() {
            let written = run
                .ctx
                .datasets
                .add_annotations(&run.parent.key, &annotations, true)?;
            debug!(dataset.key = %run.parent.key, written, "annotations written");
        }
        let scored = writer.finish()?;
        run.finish(scored)
    }
}

fn item_id(item: &Item) -> Option<String> {
    match item.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn summary_score(response: &Map<String, Value>, attribute: &str) -> Option<f64> {
    response
        .get("attributeScores")?
        .get(attribute)?
        .get("summaryScore")?
        .get("value")?
        .as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lists_every_attribute() {
        let body = analyze_request("hello", &["TOXICITY".into(), "INSULT".into()]);
        assert_eq!(body["comment"]["text"], "hello");
        assert_eq!(body["requestedAttributes"], json!({"TOXICITY": {}, "INSULT": {}}));
    }

    #[test]
    fn scores_and_ids_are_extracted() {
        let response = json!({
            "attributeScores": {"TOXICITY": {"summaryScore": {"value": 0.25, "type": "PROBABILITY"}}}
        });
        let response = response.as_object().cloned().unwrap_or_default();
        assert_eq!(summary_score(&response, "TOXICITY"), Some(0.25));
        assert_eq!(summary_score(&response, "INSULT"), None);

        let item = json!({"id": 42}).as_object().cloned().unwrap_or_default();
        assert_eq!(item_id(&item).as_deref(), Some("42"));
        let item = json!({"id": "t3_abc"}).as_object().cloned().unwrap_or_default();
        assert_eq!(item_id(&item).as_deref(), Some("t3_abc"));
        assert_eq!(item_id(&Map::new()), None);
    }
}
