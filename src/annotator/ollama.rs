use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Annotator;
use crate::error::AnnotationFailure;
use crate::model::{Alert, Annotation, AnnotationSource};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct AnnotationBody {
    summary: String,
    #[serde(default)]
    details: String,
    #[serde(default)]
    analysis: String,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Local LLM served by Ollama's `/api/generate` endpoint.
#[derive(Clone)]
pub struct OllamaAnnotator {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaAnnotator {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build annotator HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/generate", base_url.trim_end_matches('/')),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Annotator for OllamaAnnotator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn annotate(&self, alert: &Alert) -> Result<Annotation, AnnotationFailure> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: build_prompt(alert),
            stream: false,
            options: GenerateOptions {
                temperature: 0.7,
                num_predict: 500,
            },
        };

        debug!(model = %self.model, rule = %alert.rule_name, "requesting alert annotation");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AnnotationFailure::Timeout
                } else {
                    AnnotationFailure::Provider(err.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AnnotationFailure::Provider(format!(
                "status {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AnnotationFailure::Provider(err.to_string()))?;

        parse_annotation(&body.response)
    }
}

fn build_prompt(alert: &Alert) -> String {
    format!(
        r#"You are a database expert explaining a monitoring alert to an application developer.

RULE: {rule}
KIND: {kind}
ENTITY: {entity}
SEVERITY: {severity}
MESSAGE: {message}

Explain what is happening, why it matters and what to do about it, without DBA jargon.
Respond ONLY with JSON in this format:
{{"summary": "...", "details": "...", "analysis": "...", "recommendations": ["...", "..."]}}"#,
        rule = alert.rule_name,
        kind = alert.kind,
        entity = alert.entity_id,
        severity = alert.severity,
        message = alert.message,
    )
}

/// Models often wrap the JSON in a markdown code fence.
fn strip_code_fence(text: &str) -> &str {
    let text = text.trim();
    let Some(start) = text.find("```") else {
        return text;
    };
    let after = &text[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

fn parse_annotation(raw: &str) -> Result<Annotation, AnnotationFailure> {
    let body: AnnotationBody = serde_json::from_str(strip_code_fence(raw))
        .map_err(|err| AnnotationFailure::Provider(format!("invalid annotation JSON: {err}")))?;
    if body.summary.trim().is_empty() {
        return Err(AnnotationFailure::Provider("empty summary".into()));
    }
    Ok(Annotation {
        summary: body.summary,
        details: body.details,
        analysis: body.analysis,
        recommendations: body.recommendations,
        source: AnnotationSource::Provider,
    })
}
